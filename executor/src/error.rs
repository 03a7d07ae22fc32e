use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to launch {id}: {detail}")]
    Launch { id: String, detail: String },

    #[error("platform error: {0}")]
    Platform(String),

    #[error("extension error: {0}")]
    Extension(String),

    #[error("executor stopped")]
    Cancelled,

    #[error(transparent)]
    Net(#[from] vigil_net::NetError),

    #[error(transparent)]
    Mount(#[from] vigil_mount::MountError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}

impl ExecutorError {
    pub(crate) fn config(detail: impl Into<String>) -> Self {
        ExecutorError::Config(detail.into())
    }
}
