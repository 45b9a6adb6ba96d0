use super::RemoteExecutor;
use crate::error::DispatchError;
use crate::types::{CommandOutput, Host, SshSettings};
use crate::utils::wrap_in_shell;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// 通过系统 `ssh` 命令执行
///
/// 与进程内 ssh2 会话相比，它会读取用户的 ssh 配置并支持 agent
/// forwarding（例如在工作节点上从 head 节点 scp 文件）。
pub struct OpenSshExecutor {
    settings: SshSettings,
    program: String,
}

impl OpenSshExecutor {
    pub fn new(settings: SshSettings) -> Self {
        Self {
            settings,
            program: "ssh".to_string(),
        }
    }

    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    /// 构造传给 `ssh` 的参数列表（不经过本地 shell）
    pub fn build_args(&self, host: &Host, command: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref key) = self.settings.private_key_path {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args.push("-oStrictHostKeyChecking=no".to_string());
        args.push("-oBatchMode=yes".to_string());
        args.push(format!(
            "-oConnectTimeout={}",
            self.settings.connect_timeout_ms.div_ceil(1000).max(1)
        ));
        if self.settings.forward_agent {
            args.push("-A".to_string());
        }
        if self.settings.port != 22 {
            args.push("-p".to_string());
            args.push(self.settings.port.to_string());
        }
        if self.settings.username.is_empty() {
            args.push(host.address().to_string());
        } else {
            args.push(format!("{}@{}", self.settings.username, host));
        }
        args.push(wrap_in_shell(self.settings.shell.as_deref(), command));
        args
    }
}

/// ssh 自身出错（连不上、认证失败）时的退出码
const SSH_ERROR_EXIT_CODE: i32 = 255;

#[async_trait]
impl RemoteExecutor for OpenSshExecutor {
    fn name(&self) -> &str {
        "openssh"
    }

    async fn invoke(&self, host: &Host, command: &str) -> Result<CommandOutput, DispatchError> {
        let args = self.build_args(host, command);
        debug!("Spawning {} {:?}", self.program, args);

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                DispatchError::InvocationError(format!(
                    "Failed to spawn {} for {}: {}",
                    self.program, host, e
                ))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        match output.status.code() {
            Some(SSH_ERROR_EXIT_CODE) if stdout.is_empty() => Err(DispatchError::SshConnectionError(
                format!("ssh to {} failed: {}", host, stderr.trim()),
            )),
            Some(exit_code) => Ok(CommandOutput {
                exit_code,
                stdout,
                stderr,
            }),
            None => Err(DispatchError::InvocationError(format!(
                "ssh to {} was terminated by a signal",
                host
            ))),
        }
    }
}
