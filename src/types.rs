use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 远程主机地址（IP 或可路由的主机名），解析后不可变
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Host(String);

impl Host {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn address(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Host {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for Host {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// SSH 连接参数，所有主机共用一份
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub username: String,
    pub port: u16,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    pub passphrase: Option<String>,
    /// 远程用来解释命令链的 shell，None 时直接交给登录 shell
    pub shell: Option<String>,
    /// 仅外部 `ssh` 传输使用（`-A`）
    pub forward_agent: bool,
    pub connect_timeout_ms: u32,
    pub connect_attempts: u32,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            username: std::env::var("USER").unwrap_or_default(),
            port: 22,
            password: None,
            private_key_path: None,
            passphrase: None,
            shell: Some("bash".to_string()),
            forward_agent: false,
            connect_timeout_ms: 10_000,
            connect_attempts: 1,
        }
    }
}

/// 传输层返回的原始结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// 超时时使用的退出码，与 timeout(1) 一致
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// 传输失败时使用的退出码
pub const INVOCATION_FAILED_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// 远程命令运行结束，带退出码
    Exited(i32),
    /// 传输层失败，命令可能根本没有运行
    InvocationFailed(String),
    TimedOut,
}

impl ExecutionStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionStatus::Exited(code) => *code,
            ExecutionStatus::InvocationFailed(_) => INVOCATION_FAILED_EXIT_CODE,
            ExecutionStatus::TimedOut => TIMEOUT_EXIT_CODE,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Exited(0))
    }
}

/// 单台主机在一次 dispatch 中的结果，每台主机恰好一个
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub host: Host,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub batch: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn from_output(
        host: Host,
        batch: usize,
        started_at: DateTime<Utc>,
        output: CommandOutput,
    ) -> Self {
        Self {
            host,
            status: ExecutionStatus::Exited(output.exit_code),
            stdout: output.stdout,
            stderr: output.stderr,
            batch,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        host: Host,
        batch: usize,
        started_at: DateTime<Utc>,
        status: ExecutionStatus,
    ) -> Self {
        let stderr = match &status {
            ExecutionStatus::InvocationFailed(reason) => reason.clone(),
            ExecutionStatus::TimedOut => "invocation timed out".to_string(),
            ExecutionStatus::Exited(_) => String::new(),
        };
        Self {
            host,
            status,
            stdout: String::new(),
            stderr,
            batch,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferResult {
    pub success: bool,
    pub bytes_transferred: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHashInfo {
    pub algorithm: String,
    pub hash: String,
    pub size: u64,
}
