use super::RemoteExecutor;
use crate::error::DispatchError;
use crate::types::{CommandOutput, FileTransferResult, Host};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// 在控制机本地用 `sh -c` 执行，忽略主机地址
pub struct LocalExecutor {
    shell: String,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    pub fn with_shell(mut self, shell: &str) -> Self {
        self.shell = shell.to_string();
        self
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    async fn invoke(&self, host: &Host, command: &str) -> Result<CommandOutput, DispatchError> {
        debug!("Running locally on behalf of {}: {}", host, command);

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                DispatchError::InvocationError(format!(
                    "Failed to execute local command via {}: {}",
                    self.shell, e
                ))
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn supports_upload(&self) -> bool {
        true
    }

    async fn upload(
        &self,
        _host: &Host,
        remote_path: &str,
        contents: &[u8],
        mode: i32,
    ) -> Result<FileTransferResult, DispatchError> {
        tokio::fs::write(remote_path, contents).await.map_err(|e| {
            DispatchError::FileOperationError(format!("Failed to write {}: {}", remote_path, e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(mode as u32);
            tokio::fs::set_permissions(remote_path, permissions).await?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok(FileTransferResult {
            success: true,
            bytes_transferred: contents.len() as u64,
            message: format!("Wrote {} bytes to {}", contents.len(), remote_path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::CommandSequence;

    #[tokio::test]
    async fn test_short_circuit_stops_chain() {
        let executor = LocalExecutor::new();
        let command = CommandSequence::new(["cd /tmp", "false", "echo unreachable"]).render();

        let output = executor.invoke(&Host::new("localhost"), &command).await.unwrap();

        assert_ne!(output.exit_code, 0);
        assert!(!output.stdout.contains("unreachable"));
    }

    #[tokio::test]
    async fn test_directory_change_is_visible_to_later_commands() {
        let executor = LocalExecutor::new();
        let command = CommandSequence::new(["cd /", "pwd"]).render();

        let output = executor.invoke(&Host::new("localhost"), &command).await.unwrap();

        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "/");
    }

    #[tokio::test]
    async fn test_upload_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.conf");
        let path = path.to_str().unwrap();

        let result = LocalExecutor::new()
            .upload(&Host::new("localhost"), path, b"* soft nofile 500000\n", 0o644)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.bytes_transferred, 21);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "* soft nofile 500000\n");
    }
}
