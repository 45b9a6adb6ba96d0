use thiserror::Error;
use serde::Serialize;

#[derive(Error, Debug, Clone, Serialize)]
pub enum DispatchError {
    /// 主机发现失败，整个 dispatch 终止
    #[error("Host resolution failed: {0}")]
    ResolutionError(String),

    /// 传输层本身没能运行命令（区别于远程命令返回非零）
    #[error("Remote invocation failed: {0}")]
    InvocationError(String),

    #[error("SSH connection failed: {0}")]
    SshConnectionError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("File operation failed: {0}")]
    FileOperationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("SSH error: {0}")]
    Ssh2Error(String),
}

impl DispatchError {
    /// 是否应当终止整个 dispatch（而不是记录为单台主机的失败）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::ResolutionError(_)
                | DispatchError::ConfigError(_)
                | DispatchError::ValidationError(_)
                | DispatchError::NotImplemented(_)
        )
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(error: std::io::Error) -> Self {
        DispatchError::IoError(error.to_string())
    }
}

impl From<ssh2::Error> for DispatchError {
    fn from(error: ssh2::Error) -> Self {
        DispatchError::Ssh2Error(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(DispatchError::ResolutionError("gcloud exited 1".into()).is_fatal());
        assert!(DispatchError::ConfigError("max_parallelism = 0".into()).is_fatal());
        assert!(!DispatchError::InvocationError("connection reset".into()).is_fatal());
        assert!(!DispatchError::Ssh2Error("handshake".into()).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: DispatchError = io.into();
        assert!(matches!(err, DispatchError::IoError(ref m) if m.contains("no such file")));
    }
}
