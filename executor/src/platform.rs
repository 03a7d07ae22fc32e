//! Operating system capabilities the executor drives.

use std::fs::File;
use std::io::Write;
use std::net::IpAddr;

use async_trait::async_trait;
use vigil_mount::MountSpec;
use vigil_net::SharedEndpoint;

use crate::config::{ExecutorConfig, SessionConfig};
use crate::pty::{self, WindowSize};
use crate::ExecutorError;

/// Where a session's output is recorded.
pub enum SessionLog {
    /// The agent's own stdout and stderr.
    Standard,
    Writers {
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
    },
}

/// Runs once a session's exit has been fully handled.
pub type ExitHook = Box<dyn FnOnce() + Send>;

#[async_trait]
pub trait Platform: Send + Sync {
    /// One-time preparation before the first reload.
    async fn setup(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// Undo `setup`, releasing anything held on the host's behalf.
    async fn cleanup(&self) {}

    async fn set_hostname(&self, hostname: &str) -> Result<(), ExecutorError>;

    /// Map `names` to `addr` in the hosts file.
    async fn update_hosts(&self, names: &[&str], addr: IpAddr) -> Result<(), ExecutorError>;

    async fn apply_network(&self, endpoint: &SharedEndpoint) -> Result<(), ExecutorError>;

    async fn apply_firewall(&self, _config: &ExecutorConfig) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn mount(&self, spec: &MountSpec) -> Result<(), ExecutorError>;

    fn session_log(&self, session: &SessionConfig) -> Result<SessionLog, ExecutorError>;

    /// Adjust a session's environment before launch.
    fn process_env(&self, mut env: Vec<String>) -> Vec<String> {
        if !env.iter().any(|e| e.starts_with("HOME=")) {
            env.push("HOME=/root".to_string());
        }
        env
    }

    fn resize_pty(&self, pty: &File, size: WindowSize) -> Result<(), ExecutorError> {
        pty::resize(pty, size)?;
        Ok(())
    }

    /// Snapshot the VM on the host's request.
    async fn fork(&self) -> Result<(), ExecutorError> {
        Err(ExecutorError::Platform("fork is not supported".into()))
    }

    /// Called after a session exits; the returned hook runs once its state has
    /// been written back.
    fn handle_session_exit(&self, _executor_id: &str, _session_id: &str) -> Option<ExitHook> {
        None
    }
}

/// Control over the agent's own log output.
pub trait LogControl: Send + Sync {
    /// Start copying log output to the platform debug sink.
    fn open_sink(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    fn set_level(&self, debug_level: i32);
}

/// Leaves logging untouched.
pub struct NoLogControl;

impl LogControl for NoLogControl {
    fn set_level(&self, _debug_level: i32) {}
}
