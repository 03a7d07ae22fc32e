use thiserror::Error;

#[derive(Error, Debug)]
pub enum SerialError {
    /// The peer answered out of sequence. The exchange can be retried.
    #[error("handshake: {0}")]
    Handshake(String),

    #[error("handshake timed out")]
    Timeout,

    #[error("lossiness check failed: {0}")]
    Lossy(String),

    #[error("handshake cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SerialError {
    /// Whether another attempt at the handshake may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SerialError::Handshake(_) | SerialError::Timeout)
    }
}
