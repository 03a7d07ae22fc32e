use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuestError {
    #[error("failed to install log subscriber: {0}")]
    Logging(String),

    #[error("invalid configuration file {path:?}: {source}")]
    Store {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
