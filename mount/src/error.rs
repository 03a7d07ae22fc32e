use thiserror::Error;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("unmount failed: {0}")]
    UnmountFailed(String),

    #[error("invalid mount specification: {0}")]
    InvalidSpec(String),

    #[error("unsupported volume mount type for {name}: {scheme}")]
    UnsupportedScheme { name: String, scheme: String },

    #[error("timed out waiting for {0} to appear")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}
