use crate::error::DispatchError;
use crate::ssh::client::SshClient;
use crate::transport::RemoteExecutor;
use crate::types::{CommandOutput, FileTransferResult, Host, SshSettings};
use crate::utils::wrap_in_shell;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;

/// 基于 ssh2 的远程执行器
///
/// ssh2 是阻塞 API，每次调用在 `spawn_blocking` 线程里新建会话、执行、
/// 断开。阻塞线程无法从外部取消，所以调度器的超时也要传给会话本身，
/// 否则超时的主机会一直占着线程，运行时退出时也会等它。
pub struct SshExecutor {
    settings: Arc<SshSettings>,
    command_timeout: Option<Duration>,
}

impl SshExecutor {
    pub fn new(settings: SshSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            command_timeout: None,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout
    }

    async fn with_client<T, F>(&self, host: &Host, operation: F) -> Result<T, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce(SshClient) -> Result<T, DispatchError> + Send + 'static,
    {
        let settings = self.settings.clone();
        let timeout = self.command_timeout;
        let host = host.clone();
        task::spawn_blocking(move || {
            let client = SshClient::connect(&host, &settings)?.with_command_timeout(timeout);
            operation(client)
        })
        .await
        .map_err(|e| DispatchError::InvocationError(format!("SSH worker thread failed: {}", e)))?
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    fn name(&self) -> &str {
        "ssh2"
    }

    async fn invoke(&self, host: &Host, command: &str) -> Result<CommandOutput, DispatchError> {
        let command = wrap_in_shell(self.settings.shell.as_deref(), command);
        self.with_client(host, move |client| client.execute_command(&command))
            .await
    }

    fn supports_upload(&self) -> bool {
        true
    }

    async fn upload(
        &self,
        host: &Host,
        remote_path: &str,
        contents: &[u8],
        mode: i32,
    ) -> Result<FileTransferResult, DispatchError> {
        let remote_path = remote_path.to_string();
        let contents = contents.to_vec();
        self.with_client(host, move |client| {
            client.upload_contents(&remote_path, &contents, mode)
        })
        .await
    }
}
