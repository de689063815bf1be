// 错误类型
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Failures while establishing the transport session.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Authentication failed for user {username}")]
    AuthenticationFailed { username: String },

    #[error("Network unreachable: {address}: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Host key rejected for {host}: {reason}")]
    HostKeyRejected { host: String, reason: String },

    #[error("SSH handshake failed: {0}")]
    Handshake(#[source] ssh2::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not connected")]
    NotConnected,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Channel error: {message}")]
    Channel { message: String },

    #[error("Shell is already open")]
    ShellAlreadyOpen,

    /// Remote-side rejection, carrying the server's own message.
    #[error("{path}: {message}")]
    Operation { path: String, message: String },

    #[error("Stream error: {0}")]
    Stream(#[source] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("File too large: {path} exceeds {limit} bytes")]
    TooLarge { path: String, limit: u64 },

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Worker pool queue is full")]
    PoolBusy,

    #[error("Worker task aborted before completing")]
    TaskAborted,
}

impl SessionError {
    pub fn channel(message: impl Into<String>) -> Self {
        SessionError::Channel {
            message: message.into(),
        }
    }

    pub fn channel_open(err: ssh2::Error) -> Self {
        SessionError::channel(format!("failed to open channel: {}", err))
    }

    pub fn operation(path: &str, err: ssh2::Error) -> Self {
        SessionError::Operation {
            path: path.to_string(),
            message: err.message().to_string(),
        }
    }

    /// True for errors caused by the session going away rather than by the
    /// operation itself.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            SessionError::NotConnected | SessionError::ConnectionClosed
        )
    }
}
