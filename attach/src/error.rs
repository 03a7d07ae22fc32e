use thiserror::Error;

use crate::msgs::OpenFailure;

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer disconnected: {0}")]
    Disconnected(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("host key: {0}")]
    HostKey(String),

    #[error("channel open failed ({reason:?}): {detail}")]
    OpenFailed { reason: OpenFailure, detail: String },

    #[error("request {0} failed")]
    RequestFailed(String),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Serial(#[from] vigil_serial::SerialError),

    #[error(transparent)]
    Executor(#[from] vigil_executor::ExecutorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AttachError {
    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        AttachError::Protocol(detail.into())
    }
}
