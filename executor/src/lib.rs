//! Session supervision for the guest agent.
//!
//! An [`Executor`] reads its configuration from a key/value [`DataSource`],
//! applies hostname, networks and mounts through a [`Platform`], launches the
//! configured sessions and writes their runtime state back to a [`DataSink`].
//! A process-wide [`Reaper`] collects every child, including orphans adopted
//! through the subreaper attribute.

pub mod config;
mod error;
mod executor;
mod extension;
mod launch;
mod linux;
pub mod lookpath;
mod pidfile;
mod platform;
pub mod pty;
pub mod reaper;
mod session;
pub mod signal;
mod source;
pub mod user;

pub use config::{Cmd, EndpointWriter, ExecutorConfig, SessionConfig, SessionKind};
pub use error::ExecutorError;
pub use executor::{Executor, ExecutorOptions};
pub use extension::Extension;
pub use linux::LinuxPlatform;
pub use pidfile::PidFiles;
pub use platform::{ExitHook, LogControl, NoLogControl, Platform, SessionLog};
pub use reaper::{Reaper, spawn_guard};
pub use session::{EXIT_LOG_LIMIT, ExitLog, Session, SessionIo};
pub use source::{DataSink, DataSource, MapStore};
