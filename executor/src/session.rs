use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use vigil_dio::{MultiReader, MultiWriter};

use crate::config::{Reader, SessionConfig, SessionKind};
use crate::platform::SessionLog;
use crate::source::{DataSink, DataSource};
use crate::ExecutorError;

/// Exit records kept per session, oldest dropped first.
pub const EXIT_LOG_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitLog {
    pub time: i64,
    pub exit_status: i32,
}

/// Session stdio: output fanned out to the log and attached clients, input
/// merged from attached clients.
#[derive(Clone)]
pub struct SessionIo {
    pub stdout: Arc<MultiWriter>,
    pub stderr: Arc<MultiWriter>,
    pub stdin: Arc<MultiReader>,
}

impl SessionIo {
    pub fn new(log: SessionLog) -> io::Result<Self> {
        let stdout = MultiWriter::new();
        let stderr = MultiWriter::new();
        match log {
            SessionLog::Standard => {
                stdout.add_standard(io::stdout());
                stderr.add_standard(io::stderr());
            }
            SessionLog::Writers { stdout: out, stderr: err } => {
                stdout.add(out);
                stderr.add(err);
            }
        }
        Ok(Self {
            stdout: Arc::new(stdout),
            stderr: Arc::new(stderr),
            stdin: Arc::new(MultiReader::new()?),
        })
    }

    pub fn close(&self) {
        self.stdin.close();
        self.stdout.close();
        self.stderr.close();
    }
}

pub(crate) struct State {
    pub config: SessionConfig,
    pub pid: Option<i32>,
    /// A process has been started at least once.
    pub launched: bool,
    /// Reaped but exit handling not finished.
    pub exiting: bool,
    pub started: String,
    pub exit_status: i32,
    pub stop_time: i64,
    pub resurrections: u32,
    pub exit_logs: VecDeque<ExitLog>,
    pub io: Option<SessionIo>,
    pub pty: Option<Arc<File>>,
    /// Counts down as output copiers finish.
    pub drain: Option<watch::Receiver<usize>>,
    pub clear_to_launch: Option<CancellationToken>,
}

/// One supervised process, keyed by id in the executor configuration.
pub struct Session {
    id: String,
    kind: SessionKind,
    state: Mutex<State>,
}

impl Session {
    pub fn new(kind: SessionKind, config: SessionConfig) -> Self {
        Self {
            id: config.id.clone(),
            kind,
            state: Mutex::new(State {
                config,
                pid: None,
                launched: false,
                exiting: false,
                started: String::new(),
                exit_status: 0,
                stop_time: 0,
                resurrections: 0,
                exit_logs: VecDeque::new(),
                io: None,
                pty: None,
                drain: None,
                clear_to_launch: None,
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn config(&self) -> SessionConfig {
        self.state().config.clone()
    }

    pub(crate) fn set_config(&self, config: SessionConfig) {
        self.state().config = config;
    }

    pub fn pid(&self) -> Option<i32> {
        self.state().pid
    }

    /// A process is alive or its exit is still being handled.
    pub fn is_running(&self) -> bool {
        let st = self.state();
        st.pid.is_some() || st.exiting
    }

    /// Not yet launched, or launched and still alive.
    pub fn is_attachable(&self) -> bool {
        let st = self.state();
        st.pid.is_some() || (!st.launched && !st.exiting)
    }

    pub fn started(&self) -> String {
        self.state().started.clone()
    }

    pub fn exit_status(&self) -> i32 {
        self.state().exit_status
    }

    pub fn stop_time(&self) -> i64 {
        self.state().stop_time
    }

    pub fn resurrections(&self) -> u32 {
        self.state().resurrections
    }

    pub fn exit_logs(&self) -> Vec<ExitLog> {
        self.state().exit_logs.iter().copied().collect()
    }

    pub fn io(&self) -> Option<SessionIo> {
        self.state().io.clone()
    }

    pub fn pty(&self) -> Option<Arc<File>> {
        self.state().pty.clone()
    }

    pub fn tty(&self) -> bool {
        self.state().config.tty
    }

    pub fn run_block(&self) -> bool {
        self.state().config.run_block
    }

    /// Release a `run_block` launch waiting on this session. Idempotent.
    pub fn clear_to_launch(&self) {
        if let Some(gate) = &self.state().clear_to_launch {
            tracing::debug!(session = %self.id, "clear to launch");
            gate.cancel();
        }
    }

    /// Close the session's input so the process sees end-of-file.
    pub fn close_stdin(&self) {
        if let Some(io) = self.io() {
            tracing::debug!(session = %self.id, "closing stdin");
            io.stdin.close();
        }
    }

    pub fn signal(&self, signal: Signal) -> Result<(), ExecutorError> {
        let pid = self.pid().ok_or_else(|| {
            ExecutorError::Platform(format!("session {} has no running process", self.id))
        })?;
        tracing::info!(session = %self.id, pid, "sending {}", signal);
        kill(Pid::from_raw(pid), signal)?;
        Ok(())
    }

    /// Record an exit. Returns the new exit log entry.
    pub(crate) fn record_exit(&self, status: i32, now: i64) -> ExitLog {
        let mut st = self.state();
        st.exit_status = status;
        st.stop_time = now;
        let entry = ExitLog {
            time: now,
            exit_status: status,
        };
        st.exit_logs.push_back(entry);
        while st.exit_logs.len() > EXIT_LOG_LIMIT {
            st.exit_logs.pop_front();
        }
        entry
    }

    /// Pick up persisted state for a session seen for the first time.
    pub(crate) fn restore(&self, source: &dyn DataSource, prefix: &str) -> Result<(), ExecutorError> {
        let r = Reader { source, prefix };
        let mut st = self.state();
        st.started = r.string("started");
        st.exit_status = r.int("status")?.unwrap_or(0) as i32;
        st.stop_time = r.int("stopTime")?.unwrap_or(0);
        st.resurrections = r.int("diagnostics/resurrections")?.unwrap_or(0) as u32;
        st.exit_logs = r
            .json::<Vec<ExitLog>>("diagnostics/exit_logs")?
            .unwrap_or_default()
            .into();
        Ok(())
    }

    /// Write runtime state back under the session's own sub-tree.
    pub fn encode(&self, sink: &dyn DataSink) -> Result<(), ExecutorError> {
        let prefix = self.kind.key(&self.id);
        let (started, status, stop, resurrections, logs) = {
            let st = self.state();
            let logs: Vec<ExitLog> = st.exit_logs.iter().copied().collect();
            (
                st.started.clone(),
                st.exit_status,
                st.stop_time,
                st.resurrections,
                logs,
            )
        };
        sink.set(&format!("{}/started", prefix), &started)?;
        sink.set(&format!("{}/status", prefix), &status.to_string())?;
        sink.set(&format!("{}/stopTime", prefix), &stop.to_string())?;
        sink.set(
            &format!("{}/diagnostics/resurrections", prefix),
            &resurrections.to_string(),
        )?;
        sink.set(
            &format!("{}/diagnostics/exit_logs", prefix),
            &serde_json::to_string(&logs)?,
        )?;
        sink.flush()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("pid", &self.pid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MapStore;

    fn session() -> Session {
        let store = MapStore::new();
        store.insert("sessions/s1/cmd/path", "/bin/true");
        let mut config = SessionConfig::decode(&store, "sessions/s1/").unwrap();
        config.id = "s1".into();
        Session::new(SessionKind::Session, config)
    }

    #[test]
    fn test_exit_log_ring_keeps_latest() {
        let s = session();
        for i in 0..7 {
            s.record_exit(i, 100 + i as i64);
        }
        let logs = s.exit_logs();
        assert_eq!(logs.len(), EXIT_LOG_LIMIT);
        assert_eq!(logs[0].exit_status, 2);
        assert_eq!(logs[4].exit_status, 6);
        assert_eq!(s.exit_status(), 6);
        assert_eq!(s.stop_time(), 106);
    }

    #[test]
    fn test_encode_then_restore() {
        let s = session();
        s.state().started = "true".into();
        s.state().resurrections = 3;
        s.record_exit(-1, 1700000000);

        let store = MapStore::new();
        s.encode(&store).unwrap();
        assert_eq!(store.get("sessions/s1/status").as_deref(), Some("-1"));
        assert_eq!(store.get("sessions/s1/stopTime").as_deref(), Some("1700000000"));
        assert_eq!(
            store.get("sessions/s1/diagnostics/exit_logs").as_deref(),
            Some(r#"[{"time":1700000000,"exit_status":-1}]"#)
        );

        let fresh = session();
        fresh.restore(&store, "sessions/s1/").unwrap();
        assert_eq!(fresh.started(), "true");
        assert_eq!(fresh.resurrections(), 3);
        assert_eq!(fresh.exit_logs(), s.exit_logs());
    }

    #[test]
    fn test_attachable_until_exit() {
        let s = session();
        assert!(s.is_attachable());
        s.state().launched = true;
        s.state().pid = Some(4242);
        assert!(s.is_attachable());
        s.state().pid = None;
        assert!(!s.is_attachable());
    }

    #[test]
    fn test_signal_without_process() {
        let s = session();
        assert!(matches!(
            s.signal(Signal::SIGTERM),
            Err(ExecutorError::Platform(_))
        ));
    }
}
