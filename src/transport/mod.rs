//! 远程执行能力的抽象。调度器只依赖 [`RemoteExecutor`]，不关心底层是
//! ssh2 会话、外部 `ssh` 进程还是本地 shell。

mod local;
mod openssh;

pub use local::LocalExecutor;
pub use openssh::OpenSshExecutor;

use crate::error::DispatchError;
use crate::types::{CommandOutput, FileTransferResult, Host};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// 传输方式名称，用于日志
    fn name(&self) -> &str;

    /// 在一台主机上执行一条（已渲染的）命令，阻塞直到远程命令退出
    ///
    /// 远程命令返回非零不是错误；只有传输层失败才返回 `Err`。
    async fn invoke(&self, host: &Host, command: &str) -> Result<CommandOutput, DispatchError>;

    fn supports_upload(&self) -> bool {
        false
    }

    /// 把内容写到远程文件
    async fn upload(
        &self,
        host: &Host,
        remote_path: &str,
        _contents: &[u8],
        _mode: i32,
    ) -> Result<FileTransferResult, DispatchError> {
        Err(DispatchError::NotImplemented(format!(
            "{} transport cannot upload {} to {}",
            self.name(),
            remote_path,
            host
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// 进程内 ssh2 会话
    #[default]
    Ssh2,
    /// 调用系统 `ssh` 命令，支持 agent forwarding
    Openssh,
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ssh2 => write!(f, "ssh2"),
            TransportKind::Openssh => write!(f, "openssh"),
            TransportKind::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssh2" => Ok(TransportKind::Ssh2),
            "openssh" => Ok(TransportKind::Openssh),
            "local" => Ok(TransportKind::Local),
            other => Err(DispatchError::ConfigError(format!(
                "Unknown transport '{}', expected ssh2, openssh or local",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("openssh".parse::<TransportKind>().unwrap(), TransportKind::Openssh);
        assert_eq!("ssh2".parse::<TransportKind>().unwrap(), TransportKind::Ssh2);
        assert!("telnet".parse::<TransportKind>().is_err());
    }

    struct CommandOnly;

    #[async_trait]
    impl RemoteExecutor for CommandOnly {
        fn name(&self) -> &str {
            "command-only"
        }

        async fn invoke(&self, _host: &Host, _command: &str) -> Result<CommandOutput, DispatchError> {
            Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_default_upload_is_not_implemented() {
        let executor = CommandOnly;
        assert!(!executor.supports_upload());
        let err = executor
            .upload(&Host::new("10.0.0.1"), "/tmp/x", b"x", 0o644)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotImplemented(_)));
    }
}
