//! The platform as it exists inside a Linux guest.

use std::fs::{self, OpenOptions};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Command;

use async_trait::async_trait;
use nix::unistd::{gethostname, sethostname};
use tracing::{debug, error, info, warn};
use vigil_mount::{LabelDir, MountSpec, mount_volume};
use vigil_net::{NetworkEngine, SharedEndpoint};

use crate::config::{ExecutorConfig, SessionConfig};
use crate::platform::{ExitHook, Platform, SessionLog};
use crate::reaper::spawn_guard;
use crate::ExecutorError;

pub struct LinuxPlatform {
    root: PathBuf,
    engine: NetworkEngine,
    labels: LabelDir,
    /// Per-session log files; the agent's own stdio when unset.
    log_dir: Option<PathBuf>,
    /// Command asking the hypervisor to fork this VM.
    fork_command: Option<Vec<String>>,
}

impl LinuxPlatform {
    pub fn new(root: impl Into<PathBuf>, engine: NetworkEngine, labels: LabelDir) -> Self {
        Self {
            root: root.into(),
            engine,
            labels,
            log_dir: None,
            fork_command: None,
        }
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_fork_command(mut self, argv: Vec<String>) -> Self {
        self.fork_command = Some(argv).filter(|a| !a.is_empty());
        self
    }

    pub fn engine(&self) -> &NetworkEngine {
        &self.engine
    }
}

#[async_trait]
impl Platform for LinuxPlatform {
    async fn setup(&self) -> Result<(), ExecutorError> {
        self.engine.setup().await?;
        Ok(())
    }

    async fn cleanup(&self) {
        self.engine.stop().await;
    }

    async fn set_hostname(&self, hostname: &str) -> Result<(), ExecutorError> {
        let previous = gethostname()?;
        sethostname(hostname)?;

        let path = self.root.join("etc/hostname");
        if let Err(e) = fs::write(&path, format!("{}\n", hostname)) {
            error!("failed to write {:?}, reverting hostname: {}", path, e);
            if let Err(revert) = sethostname(&previous) {
                warn!("unable to restore hostname {:?}: {}", previous, revert);
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn update_hosts(&self, names: &[&str], addr: IpAddr) -> Result<(), ExecutorError> {
        self.engine.set_hosts(names, addr).await?;
        Ok(())
    }

    async fn apply_network(&self, endpoint: &SharedEndpoint) -> Result<(), ExecutorError> {
        self.engine.apply(endpoint).await?;
        Ok(())
    }

    async fn apply_firewall(&self, _config: &ExecutorConfig) -> Result<(), ExecutorError> {
        debug!("no firewall rules to apply");
        Ok(())
    }

    async fn mount(&self, spec: &MountSpec) -> Result<(), ExecutorError> {
        let spec = spec.clone();
        let labels = self.labels.clone();
        let staging = std::env::temp_dir().join(format!("vigil-copy-{}", spec.name));
        tokio::task::spawn_blocking(move || mount_volume(&spec, &labels, &staging))
            .await
            .map_err(|e| ExecutorError::Platform(format!("mount task failed: {}", e)))??;
        Ok(())
    }

    fn session_log(&self, session: &SessionConfig) -> Result<SessionLog, ExecutorError> {
        let Some(dir) = &self.log_dir else {
            return Ok(SessionLog::Standard);
        };
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.log", session.id));
        let stdout = OpenOptions::new().create(true).append(true).open(&path)?;
        let stderr = stdout.try_clone()?;
        debug!(session = %session.id, "logging session output to {:?}", path);
        Ok(SessionLog::Writers {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        })
    }

    async fn fork(&self) -> Result<(), ExecutorError> {
        let Some(argv) = self.fork_command.clone() else {
            return Err(ExecutorError::Platform("no fork command configured".into()));
        };
        info!("Requesting VM fork via {:?}", argv);
        let output = tokio::task::spawn_blocking(move || {
            // Holding the guard keeps the reaper from stealing the child's exit.
            let _guard = spawn_guard();
            Command::new(&argv[0]).args(&argv[1..]).output()
        })
        .await
        .map_err(|e| ExecutorError::Platform(format!("fork task failed: {}", e)))??;

        if !output.status.success() {
            return Err(ExecutorError::Platform(format!(
                "fork request failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn handle_session_exit(&self, executor_id: &str, session_id: &str) -> Option<ExitHook> {
        if executor_id != session_id {
            return None;
        }
        let id = session_id.to_string();
        Some(Box::new(move || {
            if std::process::id() != 1 {
                info!(session = %id, "primary session exited");
                return;
            }
            info!(session = %id, "primary session exited, powering off");
            nix::unistd::sync();
            if let Err(e) = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_POWER_OFF) {
                error!("power off failed: {}", e);
            }
        }))
    }
}
