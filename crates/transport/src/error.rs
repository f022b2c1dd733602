use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not connected")]
    NotConnected,

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("remote command exited with code {code}")]
    RemoteExit { code: i32, stderr: String },

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("pool is closed")]
    PoolClosed,

    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the coordination core may retry the operation. Remote
    /// non-zero exits and auth failures are terminal; transport-level
    /// connection failures and timeouts are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::ConnectionFailed(_) | Error::NotConnected
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
