use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("invalid network configuration: {0}")]
    Config(String),

    #[error("invalid address {0}")]
    Address(String),

    #[error("unable to locate link for slot {slot}: {detail}")]
    Slot { slot: u32, detail: String },

    /// A link, address or route operation failed. Carries the errno so the
    /// benign ones can be told apart.
    #[error("{op} failed: {detail} ({errno})")]
    Netlink {
        op: &'static str,
        errno: Errno,
        detail: String,
    },

    #[error("dhcp: {detail}")]
    Dhcp { detail: String, transient: bool },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] Errno),
}

impl NetError {
    pub fn errno(&self) -> Option<Errno> {
        match self {
            NetError::Netlink { errno, .. } => Some(*errno),
            NetError::System(errno) => Some(*errno),
            NetError::Io(e) => e.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }

    /// EAGAIN and EINTR class failures that are retried without limit.
    pub fn is_transient(&self) -> bool {
        match self {
            NetError::Dhcp { transient, .. } => *transient,
            NetError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            NetError::System(errno) => matches!(errno, Errno::EAGAIN | Errno::EINTR),
            _ => false,
        }
    }

    pub(crate) fn dhcp(detail: impl Into<String>) -> Self {
        NetError::Dhcp {
            detail: detail.into(),
            transient: false,
        }
    }
}
