//! The reload loop and session exit handling.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use tokio::sync::{RwLock, RwLockReadGuard, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ExecutorConfig, SessionKind};
use crate::extension::Extension;
use crate::pidfile::PidFiles;
use crate::platform::{LogControl, Platform};
use crate::reaper::{ReapSubscriber, Reaper, Subscription};
use crate::session::{Session, SessionIo};
use crate::signal::stop_signal;
use crate::source::{DataSink, DataSource};
use crate::ExecutorError;

const HOSTNAME_MAX: usize = 12;
const LOCAL_HOST_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 1, 1));

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Filesystem root the guest files live under.
    pub root: PathBuf,
    /// Pid file directory, relative to `root`.
    pub pidfile_dir: String,
    /// Name of the agent's own pid file.
    pub name: String,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            pidfile_dir: ".tether".to_string(),
            name: "vigil".to_string(),
        }
    }
}

/// Where a pid came from: the session's sub-tree and id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionRef {
    pub kind: SessionKind,
    pub id: String,
}

type PidTable = Arc<Mutex<HashMap<i32, SessionRef>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Claims reaped children that belong to a session and hands them to the
/// executor's exit task.
struct ExitRouter {
    pids: PidTable,
    exits: mpsc::UnboundedSender<(i32, SessionRef, i32)>,
}

impl ReapSubscriber for ExitRouter {
    fn reaped(&self, pid: i32, status: i32) -> bool {
        let Some(owner) = lock(&self.pids).remove(&pid) else {
            return false;
        };
        if self.exits.send((pid, owner, status)).is_err() {
            warn!(pid, "exit for session arrived after executor shut down");
        }
        true
    }
}

pub(crate) struct Inner {
    pub options: ExecutorOptions,
    pub source: Arc<dyn DataSource>,
    pub sink: Arc<dyn DataSink>,
    pub platform: Arc<dyn Platform>,
    logging: Arc<dyn LogControl>,
    pub config: RwLock<ExecutorConfig>,
    pub pids: PidTable,
    extensions: Mutex<Vec<Arc<dyn Extension>>>,
    reload_tx: mpsc::Sender<()>,
    reload_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    pub cancel: CancellationToken,
    /// Cancelled once no session has anything left to run.
    finished: CancellationToken,
    pub pid_files: PidFiles,
    reaping: Mutex<Option<(Arc<ExitRouter>, Subscription)>>,
}

/// Supervises the sessions described by the guest configuration.
#[derive(Clone)]
pub struct Executor {
    pub(crate) inner: Arc<Inner>,
}

impl Executor {
    pub fn new(
        options: ExecutorOptions,
        source: Arc<dyn DataSource>,
        sink: Arc<dyn DataSink>,
        platform: Arc<dyn Platform>,
        logging: Arc<dyn LogControl>,
    ) -> Self {
        let (reload_tx, reload_rx) = mpsc::channel(1);
        let pid_files = PidFiles::new(&options.root, &options.pidfile_dir);
        Self {
            inner: Arc::new(Inner {
                options,
                source,
                sink,
                platform,
                logging,
                config: RwLock::new(ExecutorConfig::default()),
                pids: Arc::new(Mutex::new(HashMap::new())),
                extensions: Mutex::new(Vec::new()),
                reload_tx,
                reload_rx: tokio::sync::Mutex::new(Some(reload_rx)),
                cancel: CancellationToken::new(),
                finished: CancellationToken::new(),
                pid_files,
                reaping: Mutex::new(None),
            }),
        }
    }

    /// Add an extension. Must happen before [`Executor::start`].
    pub fn register(&self, extension: Arc<dyn Extension>) {
        info!("Registering extension {}", extension.name());
        lock(&self.inner.extensions).push(extension);
    }

    fn extensions(&self) -> Vec<Arc<dyn Extension>> {
        lock(&self.inner.extensions).clone()
    }

    /// Ask for another reload tick. Requests made while one is already
    /// pending collapse into it.
    pub fn reload(&self) {
        match self.inner.reload_tx.try_send(()) {
            Ok(()) => debug!("reload requested"),
            Err(mpsc::error::TrySendError::Full(_)) => debug!("reload already pending"),
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("reload after executor loop ended"),
        }
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.inner.platform
    }

    pub fn sink(&self) -> &Arc<dyn DataSink> {
        &self.inner.sink
    }

    /// Cancelled when the executor stops.
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub async fn config(&self) -> RwLockReadGuard<'_, ExecutorConfig> {
        self.inner.config.read().await
    }

    pub async fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.config.read().await.session(id)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.inner.config.read().await.session_ids()
    }

    /// Pids of the session processes currently alive.
    pub fn running_pids(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = lock(&self.inner.pids).keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Run the executor until it is stopped, a reload fails, or every session
    /// has exited for good.
    pub async fn start(&self) -> Result<(), ExecutorError> {
        let mut reloads = self
            .inner
            .reload_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ExecutorError::config("executor already started"))?;

        self.setup().await?;
        self.reload();

        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => {
                    info!("Executor stopped");
                    return Ok(());
                }
                _ = self.inner.finished.cancelled() => {
                    info!("No sessions left to run, leaving executor loop");
                    return Ok(());
                }
                tick = reloads.recv() => {
                    if tick.is_none() {
                        return Ok(());
                    }
                    self.tick().await?;
                }
            }
        }
    }

    /// Stop the executor. Idempotent.
    pub async fn stop(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        info!("Stopping executor");
        self.inner.cancel.cancel();

        for ext in self.extensions() {
            if let Err(e) = ext.stop().await {
                warn!("failed to stop extension {}: {}", ext.name(), e);
            }
        }
        self.inner.platform.cleanup().await;
        // The last subscription to go stops the reaper thread.
        lock(&self.inner.reaping).take();
    }

    async fn setup(&self) -> Result<(), ExecutorError> {
        if let Err(e) = self.inner.logging.open_sink() {
            warn!("unable to open debug log sink: {}", e);
        }
        self.inner.platform.setup().await?;

        let reaper = Reaper::global()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Arc::new(ExitRouter {
            pids: self.inner.pids.clone(),
            exits: tx,
        });
        let subscription = reaper.subscribe(router.clone())?;
        *lock(&self.inner.reaping) = Some((router, subscription));
        tokio::spawn(self.clone().exits(rx));

        for ext in self.extensions() {
            info!("Starting extension {}", ext.name());
            ext.start().await?;
        }

        self.inner.pid_files.create_dir()?;
        let own = self
            .inner
            .pid_files
            .write(&self.inner.options.name, std::process::id() as i32)?;
        debug!("wrote agent pid file {:?}", own);

        // Collect zombies left from before the handler existed.
        reaper.prime()?;
        Ok(())
    }

    async fn tick(&self) -> Result<(), ExecutorError> {
        info!("Loading main configuration");
        {
            let mut config = self.inner.config.write().await;
            config.decode(&*self.inner.source).await?;
        }
        let config = self.inner.config.read().await;

        self.inner.logging.set_level(config.debug_level);
        if config.debug_level > 1 {
            for (key, value) in config.dump(&*self.inner.source) {
                debug!("config {} = {}", key, value);
            }
        }

        let platform = &self.inner.platform;
        let short: String = config.id.chars().take(HOSTNAME_MAX).collect();
        info!("Setting hostname to {}", short);
        platform.set_hostname(&short).await?;
        let mut names = vec![short.as_str()];
        if !config.name.is_empty() {
            names.push(config.name.as_str());
        }
        platform.update_hosts(&names, LOCAL_HOST_ADDR).await?;

        for (name, endpoint) in &config.networks {
            info!("Applying network {}", name);
            platform.apply_network(endpoint).await?;
        }
        config.encode_networks(&*self.inner.sink).await?;
        self.inner.sink.flush()?;

        if let Err(e) = platform.apply_firewall(&config).await {
            error!("failed to apply firewall rules: {}", e);
        }

        for spec in config.mounts.values() {
            platform.mount(spec).await?;
        }

        for session in config.all_sessions() {
            self.initialize(session)?;
        }

        for ext in self.extensions() {
            debug!("reloading extension {}", ext.name());
            ext.reload(&config).await?;
        }

        let mut launches = Vec::new();
        for session in config.all_sessions() {
            if !self.needs_launch(session)? {
                continue;
            }
            let this = self.clone();
            let session = session.clone();
            launches.push(async move {
                let id = session.id().to_string();
                let kind = session.kind();
                let result = tokio::spawn(async move { this.launch(session).await })
                    .await
                    .unwrap_or_else(|e| {
                        Err(ExecutorError::Launch {
                            id: id.clone(),
                            detail: e.to_string(),
                        })
                    });
                (kind, id, result)
            });
        }

        let mut failure = None;
        for (kind, id, result) in join_all(launches).await {
            let Err(e) = result else { continue };
            match kind {
                SessionKind::Session => {
                    error!(session = %id, "launch failed: {}", e);
                    failure.get_or_insert(e);
                }
                SessionKind::Exec => warn!(exec = %id, "launch failed: {}", e),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Give a session that is about to run its stdio and launch gate.
    fn initialize(&self, session: &Session) -> Result<(), ExecutorError> {
        let mut st = session.state();
        let pending = st.pid.is_none()
            && !st.exiting
            && st.config.active
            && (!st.launched || st.config.restart);
        if st.io.is_some() || !pending {
            return Ok(());
        }

        debug!(session = %session.id(), "initializing session stdio");
        let log = self.inner.platform.session_log(&st.config)?;
        st.io = Some(SessionIo::new(log)?);
        if st.config.run_block && st.clear_to_launch.is_none() {
            st.clear_to_launch = Some(CancellationToken::new());
        }
        Ok(())
    }

    /// Decide what a tick does with one session; `true` means launch it.
    fn needs_launch(&self, session: &Session) -> Result<bool, ExecutorError> {
        let relaunch = {
            let mut st = session.state();
            if st.exiting {
                return Ok(false);
            }
            if let Some(pid) = st.pid {
                if !st.config.active {
                    let signal = stop_signal(&st.config.stop_signal)?;
                    drop(st);
                    info!(session = %session.id(), pid, "Session is inactive, sending {}", signal);
                    if let Err(e) = session.signal(signal) {
                        warn!(session = %session.id(), "unable to stop session: {}", e);
                    }
                }
                return Ok(false);
            }
            if !st.config.active {
                return Ok(false);
            }
            if !st.launched {
                info!(session = %session.id(), "Launching process for session");
                return Ok(true);
            }
            if !st.config.restart {
                debug!(session = %session.id(), "session exited and is not configured for restart");
                return Ok(false);
            }
            st.resurrections += 1;
            st.resurrections
        };

        warn!(session = %session.id(), resurrections = relaunch, "Re-launching process for session");
        session.encode(&*self.inner.sink)?;
        Ok(true)
    }

    async fn exits(self, mut rx: mpsc::UnboundedReceiver<(i32, SessionRef, i32)>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                exit = rx.recv() => {
                    let Some((pid, owner, status)) = exit else { return };
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_exit(pid, owner, status).await });
                }
            }
        }
    }

    async fn handle_exit(&self, pid: i32, owner: SessionRef, status: i32) {
        let session = {
            let config = self.inner.config.read().await;
            match owner.kind {
                SessionKind::Session => config.sessions.get(&owner.id).cloned(),
                SessionKind::Exec => config.execs.get(&owner.id).cloned(),
            }
        };
        let Some(session) = session else {
            warn!(pid, session = %owner.id, "exited process belongs to an unknown session");
            return;
        };

        {
            let mut st = session.state();
            if st.pid == Some(pid) {
                st.pid = None;
            }
            st.exiting = true;
        }
        info!(session = %session.id(), pid, status, "Session process exited");
        session.record_exit(status, now());

        let drain = session.state().drain.take();
        if let Some(mut drain) = drain {
            // Err means every copier is gone, which is just as drained.
            let _ = drain.wait_for(|remaining| *remaining == 0).await;
        }

        let (io, gate, path) = {
            let mut st = session.state();
            st.pty = None;
            (
                st.io.take(),
                st.clear_to_launch.take(),
                st.config.cmd.path.clone(),
            )
        };
        if let Some(io) = io {
            io.close();
        }
        if let Some(gate) = gate {
            gate.cancel();
        }
        self.inner.pid_files.remove(&path);

        let executor_id = self.inner.config.read().await.id.clone();
        let hook = self
            .inner
            .platform
            .handle_session_exit(&executor_id, session.id());
        if let Err(e) = session.encode(&*self.inner.sink) {
            error!(session = %session.id(), "unable to record exit: {}", e);
        }

        let restart = {
            let mut st = session.state();
            st.exiting = false;
            st.config.restart && st.config.active
        };
        if let Some(hook) = hook {
            hook();
        }

        if restart {
            self.reload();
        } else if self.idle().await {
            self.inner.finished.cancel();
        }
    }

    /// No process is alive and nothing is waiting to be launched again.
    async fn idle(&self) -> bool {
        if !lock(&self.inner.pids).is_empty() {
            return false;
        }
        let config = self.inner.config.read().await;
        config.all_sessions().all(|s| {
            let st = s.state();
            st.pid.is_none() && !st.exiting && st.launched && !(st.config.restart && st.config.active)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_claims_only_known_pids() {
        let pids: PidTable = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = ExitRouter {
            pids: pids.clone(),
            exits: tx,
        };
        lock(&pids).insert(
            41,
            SessionRef {
                kind: SessionKind::Exec,
                id: "worker".into(),
            },
        );

        assert!(!router.reaped(40, 0));
        assert!(router.reaped(41, -1));
        assert!(!router.reaped(41, -1));

        let (pid, owner, status) = rx.try_recv().unwrap();
        assert_eq!((pid, status), (41, -1));
        assert_eq!(owner.id, "worker");
        assert!(lock(&pids).is_empty());
    }
}
