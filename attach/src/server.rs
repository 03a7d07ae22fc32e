//! The attach server: lets a host-side client reach session stdio over the
//! serial backchannel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_dio::{ReaderId, WriterId};
use vigil_executor::signal::ssh_signal;
use vigil_executor::{ExecutorConfig, ExecutorError, Extension, Platform, Session, SessionIo};
use vigil_serial::{Handshaker, SerialError, SerialPort};

use crate::connection::{ChannelRequest, Connection, GlobalRequest, Incoming, PendingOpen};
use crate::msgs::{
    unmarshal_signal, unmarshal_window_change, ContainersMsg, OpenFailure, ATTACH_CHANNEL,
    CLOSE_STDIN_REQ, CONTAINERS_REQ, SIGNAL_REQ, WINDOW_CHANGE_REQ,
};
use crate::transport::hostkey::HostKey;
use crate::AttachError;

const RETRY_DELAY: Duration = Duration::from_millis(100);

/// A raw byte stream the attach protocol can run over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Source of the link to the host. Opened again after every connection.
#[async_trait]
pub trait Backchannel: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Stream>, AttachError>;
}

/// The virtual serial port the hypervisor exposes for attach.
pub struct SerialBackchannel {
    path: PathBuf,
}

impl SerialBackchannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Backchannel for SerialBackchannel {
    async fn open(&self) -> Result<Box<dyn Stream>, AttachError> {
        Ok(Box::new(SerialPort::open(&self.path)?))
    }
}

/// What the server knows of the configuration as of the last reload.
#[derive(Default)]
struct Snapshot {
    ids: Vec<String>,
    sessions: HashMap<String, Arc<Session>>,
    key: String,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    platform: Arc<dyn Platform>,
    backchannel: Arc<dyn Backchannel>,
    snapshot: RwLock<Snapshot>,
}

pub struct AttachServer {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AttachServer {
    pub fn new(platform: Arc<dyn Platform>, backchannel: Arc<dyn Backchannel>) -> Self {
        Self {
            shared: Arc::new(Shared {
                platform,
                backchannel,
                snapshot: RwLock::new(Snapshot::default()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    fn launch(&self) -> Result<(), ExecutorError> {
        let mut running = lock(&self.running);
        if running.is_some() {
            debug!("attach server is already enabled");
            return Ok(());
        }

        // don't assume the key is unchanged since the last start
        let key = HostKey::parse(&self.shared.snapshot().key)
            .map_err(|e| ExecutorError::Platform(format!("failed to load key for attach: {}", e)))?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.shared.clone().run(key, cancel.clone()));
        *running = Some(Running { cancel, task });
        info!("attach server started");
        Ok(())
    }
}

#[async_trait]
impl Extension for AttachServer {
    fn name(&self) -> &str {
        "attach"
    }

    async fn start(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn reload(&self, config: &ExecutorConfig) -> Result<(), ExecutorError> {
        let wanted = config.all_sessions().any(|s| s.config().attach);
        {
            let mut snapshot = self
                .shared
                .snapshot
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            snapshot.ids = config.session_ids();
            snapshot.sessions = config
                .all_sessions()
                .map(|s| (s.id().to_string(), s.clone()))
                .collect();
            snapshot.key = config.key.clone();
        }
        if !wanted {
            return Ok(());
        }
        self.launch().map_err(|e| {
            error!("unable to start attach server: {}", e);
            e
        })
    }

    async fn stop(&self) -> Result<(), ExecutorError> {
        let Some(running) = lock(&self.running).take() else {
            debug!("attach server is not enabled");
            return Ok(());
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!("attach server task ended abnormally: {}", e);
        }
        info!("attach server stopped");
        Ok(())
    }
}

impl Shared {
    fn snapshot(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Establish connections one after another until cancelled.
    async fn run(self: Arc<Self>, key: HostKey, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            info!("Trying to establish a connection");
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                opened = self.backchannel.open() => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    error!("failed to create raw connection: {}", e);
                    pause(&cancel).await;
                    continue;
                }
            };

            match Handshaker::new().respond_until(&mut stream, &cancel).await {
                Ok(()) => {}
                Err(SerialError::Cancelled) => break,
                Err(e) => {
                    error!("failed to establish backchannel: {}", e);
                    pause(&cancel).await;
                    continue;
                }
            }

            let conn = tokio::select! {
                _ = cancel.cancelled() => break,
                conn = Connection::accept(stream, &key) => conn,
            };
            match conn {
                Ok(conn) => {
                    info!("Ready to service attach requests");
                    self.service(conn, &cancel).await;
                    info!("Incoming attach channel closed");
                }
                Err(e) => error!("failed to establish ssh handshake: {}", e),
            }
        }
        debug!("attach server loop exiting");
    }

    async fn service(&self, mut conn: Connection, cancel: &CancellationToken) {
        // released once a container-ids request has been answered
        let answered = CancellationToken::new();
        let closed = CancellationToken::new();

        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => {
                    conn.disconnect();
                    break;
                }
                incoming = conn.next() => incoming,
            };
            match incoming {
                Some(Incoming::Global(req)) => self.global(req, &answered),
                Some(Incoming::Open(open)) => self.open(open, &answered, &closed).await,
                None => break,
            }
        }
        closed.cancel();
        if let Err(e) = conn.closed().await {
            debug!("attach connection ended: {}", e);
        }
    }

    fn global(&self, req: GlobalRequest, answered: &CancellationToken) {
        info!("received global request type {}", req.name);
        match req.name.as_str() {
            CONTAINERS_REQ => {
                let msg = ContainersMsg {
                    ids: self.snapshot().ids.clone(),
                };
                debug!("returning container ids {:?}", msg.ids);
                req.reply(true, msg.marshal());
                answered.cancel();
            }
            other => {
                warn!("unknown global request type: {}", other);
                req.reply(false, Vec::new());
            }
        }
    }

    async fn open(&self, open: PendingOpen, answered: &CancellationToken, closed: &CancellationToken) {
        if open.kind != ATTACH_CHANNEL {
            let detail = format!("unknown channel type {}", open.kind);
            error!("{}", detail);
            open.reject(OpenFailure::UnknownChannelType, detail);
            return;
        }
        if open.extra.is_empty() {
            let detail = "attach channel requires ID in ExtraData";
            error!("{}", detail);
            open.reject(OpenFailure::Prohibited, detail);
            return;
        }

        let id = String::from_utf8_lossy(&open.extra).into_owned();
        let found = self
            .snapshot()
            .sessions
            .get(&id)
            .filter(|s| s.is_attachable())
            .and_then(|s| s.io().map(|io| (s.clone(), io)));
        let Some((session, io)) = found else {
            let detail = "specified ID for attach is unavailable";
            error!(session = %id, "{}", detail);
            open.reject(OpenFailure::Prohibited, detail);
            return;
        };

        let mut channel = match open.accept().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(session = %id, "could not accept channel: {}", e);
                return;
            }
        };

        let binding = Binding {
            stdout: io.stdout.add(channel.writer()),
            // a tty merges stderr into stdout
            stderr: (!session.tty()).then(|| io.stderr.add(channel.stderr_writer())),
            stdin: channel
                .take_reader()
                .map(|(reader, stop)| io.stdin.add_closable(reader, stop)),
            io,
        };
        let requests = channel.take_requests();
        drop(channel);
        debug!(session = %id, "reader/writers bound for channel");

        tokio::spawn(channel_mux(self.platform.clone(), session.clone(), requests, binding));

        if session.run_block() && session.started() != "true" {
            let answered = answered.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = answered.cancelled() => {
                        debug!(session = %session.id(), "Unblocking the launch");
                        session.clear_to_launch();
                    }
                    _ = closed.cancelled() => {}
                }
            });
        }
    }
}

async fn pause(cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(RETRY_DELAY) => {}
    }
}

/// One channel's endpoints in a session's stdio.
struct Binding {
    io: SessionIo,
    stdout: WriterId,
    stderr: Option<WriterId>,
    stdin: Option<ReaderId>,
}

impl Binding {
    fn detach(&self) {
        self.io.stdout.remove(self.stdout);
        if let Some(id) = self.stderr {
            self.io.stderr.remove(id);
        }
        if let Some(id) = self.stdin {
            self.io.stdin.remove(id);
        }
    }
}

/// Service one channel's requests in arrival order, then detach it.
async fn channel_mux(
    platform: Arc<dyn Platform>,
    session: Arc<Session>,
    requests: Option<mpsc::UnboundedReceiver<ChannelRequest>>,
    binding: Binding,
) {
    if let Some(mut requests) = requests {
        while let Some(req) = requests.recv().await {
            handle_request(&*platform, &session, req);
        }
    }

    debug!(session = %session.id(), "cleanup on detach from the session");
    if let Err(e) = tokio::task::spawn_blocking(move || binding.detach()).await {
        warn!(session = %session.id(), "detach failed: {}", e);
    }
}

fn handle_request(platform: &dyn Platform, session: &Arc<Session>, req: ChannelRequest) {
    debug!(session = %session.id(), "channel request {}", req.name);
    let result = match req.name.as_str() {
        WINDOW_CHANGE_REQ => match session.pty() {
            None => Err("illegal window-change request for non-tty".to_string()),
            Some(pty) => unmarshal_window_change(&req.payload)
                .map_err(|e| e.to_string())
                .and_then(|size| platform.resize_pty(&pty, size).map_err(|e| e.to_string())),
        },
        SIGNAL_REQ => unmarshal_signal(&req.payload)
            .map_err(|e| e.to_string())
            .and_then(|name| ssh_signal(&name).map_err(|e| e.to_string()))
            .and_then(|sig| session.signal(sig).map_err(|e| e.to_string())),
        CLOSE_STDIN_REQ => {
            // reply first, the close can block behind in-flight input
            req.reply(true);
            let session = session.clone();
            tokio::task::spawn_blocking(move || session.close_stdin());
            return;
        }
        other => Err(format!("ssh request type {} is not supported", other)),
    };

    if let Err(detail) = &result {
        error!(session = %session.id(), "{}", detail);
    }
    req.reply(result.is_ok());
}
