use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("remote: permission denied: {0}")]
    PermissionDenied(String),

    #[error("remote: {0}")]
    ExecutionError(String),

    #[error("remote: command timed out after {secs}s: {command}")]
    Timeout { command: String, secs: u64 },

    #[error("transfer: {0}")]
    TransferError(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("ssh2docker: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Classify the error stream of a failed remote command into a more
    /// specific `GatewayError` when possible.
    pub fn from_stderr(path: &str, stderr: &str) -> Self {
        let msg = stderr.trim();
        if msg.contains("No such file") || msg.contains("cannot access") {
            GatewayError::NotFound(path.to_string())
        } else if msg.contains("Permission denied")
            || msg.contains("permission denied")
            || msg.contains("Operation not permitted")
        {
            GatewayError::PermissionDenied(path.to_string())
        } else {
            GatewayError::ExecutionError(msg.to_string())
        }
    }

    /// Classify a failed archive copy. Missing paths stay `NotFound`, the
    /// rest is a transfer failure.
    pub fn from_transfer(path: &str, reason: impl std::fmt::Display) -> Self {
        let msg = reason.to_string();
        if msg.contains("No such container:path")
            || msg.contains("Could not find the file")
            || msg.contains("No such file")
        {
            GatewayError::NotFound(path.to_string())
        } else {
            GatewayError::TransferError(msg)
        }
    }

    /// Re-classify a generic remote failure against the path it concerned.
    pub fn about(self, path: &str) -> Self {
        match self {
            GatewayError::ExecutionError(msg) => Self::from_stderr(path, &msg),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => GatewayError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => GatewayError::PermissionDenied(err.to_string()),
            _ => GatewayError::Internal(err.to_string()),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
