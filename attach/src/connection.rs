//! SSH connection protocol (RFC 4254): channels and requests multiplexed
//! over one transport.
//!
//! A reader task pulls packets off the transport and a driver task owns the
//! writer and all channel state. Handles talk to the driver over a command
//! queue, so the sync endpoints handed to session stdio never touch the
//! runtime directly.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::auth;
use crate::msgs::*;
use crate::transport::hostkey::HostKey;
use crate::transport::{PacketReader, PacketWriter, Transport, DISCONNECT_BY_APPLICATION, DISCONNECT_PROTOCOL_ERROR};
use crate::wire::{Cursor, Put};
use crate::AttachError;

/// Receive window advertised for every channel.
pub const WINDOW: u32 = 2 * 1024 * 1024;
/// Largest data payload we accept or send in one packet.
pub const MAX_PACKET_DATA: u32 = 32 * 1024;
/// Bytes a sync writer may queue ahead of the peer's window.
const WRITE_BUDGET: usize = 1024 * 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Cmd {
    Open {
        kind: String,
        extra: Vec<u8>,
        reply: oneshot::Sender<Result<Channel, AttachError>>,
    },
    Confirm {
        remote: u32,
        window: u32,
        max_packet: u32,
        reply: oneshot::Sender<Channel>,
    },
    Reject {
        remote: u32,
        reason: OpenFailure,
        detail: String,
    },
    Global {
        name: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    GlobalReply {
        ok: bool,
        payload: Vec<u8>,
    },
    Data {
        id: u32,
        stderr: bool,
        data: Vec<u8>,
    },
    Consumed {
        id: u32,
        n: usize,
    },
    Request {
        id: u32,
        name: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
    RequestReply {
        id: u32,
        ok: bool,
    },
    StopReading {
        id: u32,
    },
    Eof {
        id: u32,
    },
    Close {
        id: u32,
    },
    Disconnect,
}

/// Bytes queued by sync writers and not yet on the wire.
struct Budget {
    queued: Mutex<usize>,
    cond: Condvar,
    closed: AtomicBool,
}

impl Budget {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(0),
            cond: Condvar::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn reserve(&self, n: usize) -> io::Result<()> {
        let mut queued = lock(&self.queued);
        while *queued >= WRITE_BUDGET && !self.is_closed() {
            queued = self
                .cond
                .wait(queued)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "channel closed"));
        }
        *queued += n;
        Ok(())
    }

    fn release(&self, n: usize) {
        let mut queued = lock(&self.queued);
        *queued = queued.saturating_sub(n);
        self.cond.notify_all();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _queued = lock(&self.queued);
        self.cond.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Something the peer asked of us.
pub enum Incoming {
    Global(GlobalRequest),
    Open(PendingOpen),
}

pub struct GlobalRequest {
    pub name: String,
    pub payload: Vec<u8>,
    want_reply: bool,
    cmd: mpsc::UnboundedSender<Cmd>,
    answered: bool,
}

impl GlobalRequest {
    pub fn reply(mut self, ok: bool, payload: Vec<u8>) {
        self.answered = true;
        if self.want_reply {
            let _ = self.cmd.send(Cmd::GlobalReply { ok, payload });
        }
    }
}

impl Drop for GlobalRequest {
    fn drop(&mut self) {
        if !self.answered && self.want_reply {
            let _ = self.cmd.send(Cmd::GlobalReply {
                ok: false,
                payload: Vec::new(),
            });
        }
    }
}

/// A channel the peer wants to open. Dropping it refuses the open.
pub struct PendingOpen {
    pub kind: String,
    pub extra: Vec<u8>,
    remote: u32,
    window: u32,
    max_packet: u32,
    cmd: mpsc::UnboundedSender<Cmd>,
    answered: bool,
}

impl PendingOpen {
    pub async fn accept(mut self) -> Result<Channel, AttachError> {
        self.answered = true;
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(Cmd::Confirm {
                remote: self.remote,
                window: self.window,
                max_packet: self.max_packet,
                reply,
            })
            .map_err(|_| AttachError::Closed)?;
        rx.await.map_err(|_| AttachError::Closed)
    }

    pub fn reject(mut self, reason: OpenFailure, detail: impl Into<String>) {
        self.answered = true;
        let _ = self.cmd.send(Cmd::Reject {
            remote: self.remote,
            reason,
            detail: detail.into(),
        });
    }
}

impl Drop for PendingOpen {
    fn drop(&mut self) {
        if !self.answered {
            let _ = self.cmd.send(Cmd::Reject {
                remote: self.remote,
                reason: OpenFailure::ResourceShortage,
                detail: "channel open not handled".into(),
            });
        }
    }
}

/// A request the peer made on one channel. Dropping it answers `false`.
pub struct ChannelRequest {
    pub name: String,
    pub payload: Vec<u8>,
    id: u32,
    want_reply: bool,
    cmd: mpsc::UnboundedSender<Cmd>,
    answered: bool,
}

impl ChannelRequest {
    pub fn reply(mut self, ok: bool) {
        self.answered = true;
        if self.want_reply {
            let _ = self.cmd.send(Cmd::RequestReply { id: self.id, ok });
        }
    }
}

impl Drop for ChannelRequest {
    fn drop(&mut self) {
        if !self.answered && self.want_reply {
            let _ = self.cmd.send(Cmd::RequestReply { id: self.id, ok: false });
        }
    }
}

/// Sends CLOSE once the last writer or handle is gone.
struct CloseGuard {
    id: u32,
    cmd: mpsc::UnboundedSender<Cmd>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let _ = self.cmd.send(Cmd::Close { id: self.id });
    }
}

/// One open channel.
///
/// Output endpoints from [`Channel::writer`] keep the channel open after the
/// handle itself is dropped; it closes when the last of them goes.
pub struct Channel {
    id: u32,
    cmd: mpsc::UnboundedSender<Cmd>,
    budget: Arc<Budget>,
    guard: Arc<CloseGuard>,
    data: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    ext: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    requests: Option<mpsc::UnboundedReceiver<ChannelRequest>>,
}

impl Channel {
    pub fn id(&self) -> u32 {
        self.id
    }

    fn send(&self, cmd: Cmd) -> Result<(), AttachError> {
        self.cmd.send(cmd).map_err(|_| AttachError::Closed)
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), AttachError> {
        if self.budget.is_closed() {
            return Err(AttachError::Closed);
        }
        self.send(Cmd::Data {
            id: self.id,
            stderr: false,
            data: data.to_vec(),
        })
    }

    pub async fn write_stderr(&self, data: &[u8]) -> Result<(), AttachError> {
        if self.budget.is_closed() {
            return Err(AttachError::Closed);
        }
        self.send(Cmd::Data {
            id: self.id,
            stderr: true,
            data: data.to_vec(),
        })
    }

    async fn recv(
        rx: &mut Option<mpsc::UnboundedReceiver<Vec<u8>>>,
        id: u32,
        cmd: &mpsc::UnboundedSender<Cmd>,
    ) -> Option<Vec<u8>> {
        let chunk = rx.as_mut()?.recv().await?;
        let _ = cmd.send(Cmd::Consumed { id, n: chunk.len() });
        Some(chunk)
    }

    /// Next chunk of channel data, `None` at end-of-file.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        Self::recv(&mut self.data, self.id, &self.cmd).await
    }

    /// Next chunk of extended (stderr) data.
    pub async fn read_stderr(&mut self) -> Option<Vec<u8>> {
        Self::recv(&mut self.ext, self.id, &self.cmd).await
    }

    /// Send a channel request and wait for the peer's answer.
    pub async fn request(&self, name: &str, payload: Vec<u8>) -> Result<bool, AttachError> {
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::Request {
            id: self.id,
            name: name.to_string(),
            payload,
            reply,
        })?;
        rx.await.map_err(|_| AttachError::Closed)
    }

    pub fn eof(&self) -> Result<(), AttachError> {
        self.send(Cmd::Eof { id: self.id })
    }

    pub fn close(&self) -> Result<(), AttachError> {
        self.send(Cmd::Close { id: self.id })
    }

    pub fn writer(&self) -> ChannelWriter {
        ChannelWriter {
            id: self.id,
            stderr: false,
            cmd: self.cmd.clone(),
            budget: self.budget.clone(),
            _guard: self.guard.clone(),
        }
    }

    pub fn stderr_writer(&self) -> ChannelWriter {
        ChannelWriter {
            stderr: true,
            ..self.writer()
        }
    }

    /// Channel data as a blocking reader, along with a hook that makes the
    /// reader see end-of-file.
    pub fn take_reader(&mut self) -> Option<(ChannelReader, impl FnOnce() + Send + 'static)> {
        let rx = self.data.take()?;
        let reader = ChannelReader {
            id: self.id,
            rx,
            cmd: self.cmd.clone(),
            chunk: Vec::new(),
            pos: 0,
        };
        let id = self.id;
        let cmd = self.cmd.clone();
        let stop = move || {
            let _ = cmd.send(Cmd::StopReading { id });
        };
        Some((reader, stop))
    }

    pub fn take_requests(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelRequest>> {
        self.requests.take()
    }
}

/// Blocking output endpoint. Reports `UnexpectedEof` once the channel is
/// closed.
pub struct ChannelWriter {
    id: u32,
    stderr: bool,
    cmd: mpsc::UnboundedSender<Cmd>,
    budget: Arc<Budget>,
    _guard: Arc<CloseGuard>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.budget.reserve(buf.len())?;
        self.cmd
            .send(Cmd::Data {
                id: self.id,
                stderr: self.stderr,
                data: buf.to_vec(),
            })
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Blocking input endpoint. Must not be read from inside the runtime.
pub struct ChannelReader {
    id: u32,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cmd: mpsc::UnboundedSender<Cmd>,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.chunk.len() {
            match self.rx.blocking_recv() {
                Some(chunk) => {
                    let _ = self.cmd.send(Cmd::Consumed {
                        id: self.id,
                        n: chunk.len(),
                    });
                    self.chunk = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct Open {
    remote: u32,
    remote_window: u32,
    remote_max: u32,
    /// Delivered to readers but not yet acknowledged with a window adjust.
    consumed: usize,
    data_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    ext_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    req_tx: Option<mpsc::UnboundedSender<ChannelRequest>>,
    outbound: VecDeque<(bool, Vec<u8>)>,
    budget: Arc<Budget>,
    pending: VecDeque<oneshot::Sender<bool>>,
    eof_pending: bool,
    eof_sent: bool,
    close_pending: bool,
    close_sent: bool,
}

enum Slot {
    Opening(oneshot::Sender<Result<Channel, AttachError>>),
    Open(Box<Open>),
}

struct Driver<W> {
    writer: PacketWriter<W>,
    cmd: mpsc::UnboundedSender<Cmd>,
    incoming: mpsc::UnboundedSender<Incoming>,
    channels: HashMap<u32, Slot>,
    next_id: u32,
    pending_globals: VecDeque<oneshot::Sender<Option<Vec<u8>>>>,
}

impl<W: AsyncWrite + Unpin> Driver<W> {
    async fn run(
        mut self,
        mut packets: mpsc::UnboundedReceiver<Result<Vec<u8>, AttachError>>,
        mut cmds: mpsc::UnboundedReceiver<Cmd>,
    ) -> Result<(), AttachError> {
        let result = loop {
            tokio::select! {
                packet = packets.recv() => match packet {
                    Some(Ok(p)) => {
                        if let Err(e) = self.handle(p).await {
                            break Err(e);
                        }
                    }
                    Some(Err(AttachError::Disconnected(reason))) => {
                        debug!("peer disconnected: {}", reason);
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
                cmd = cmds.recv() => match cmd {
                    Some(Cmd::Disconnect) | None => {
                        let _ = self.writer.disconnect(DISCONNECT_BY_APPLICATION, "closed").await;
                        break Ok(());
                    }
                    Some(c) => {
                        if let Err(e) = self.command(c).await {
                            break Err(e);
                        }
                    }
                },
            }
        };

        for (_, slot) in self.channels.drain() {
            if let Slot::Open(open) = slot {
                open.budget.close();
            }
        }
        result
    }

    async fn handle(&mut self, payload: Vec<u8>) -> Result<(), AttachError> {
        let mut c = Cursor::new(&payload);
        let msg = c.u8()?;
        trace!(msg, len = payload.len(), "received");
        match msg {
            MSG_KEXINIT => {
                self.writer
                    .disconnect(DISCONNECT_PROTOCOL_ERROR, "re-keying is not supported")
                    .await?;
                Err(AttachError::protocol("peer attempted to re-key"))
            }
            MSG_GLOBAL_REQUEST => {
                let name = c.utf8()?;
                let want_reply = c.bool()?;
                let request = GlobalRequest {
                    name,
                    payload: c.rest().to_vec(),
                    want_reply,
                    cmd: self.cmd.clone(),
                    answered: false,
                };
                let _ = self.incoming.send(Incoming::Global(request));
                Ok(())
            }
            MSG_REQUEST_SUCCESS | MSG_REQUEST_FAILURE => {
                if let Some(reply) = self.pending_globals.pop_front() {
                    let _ = reply.send((msg == MSG_REQUEST_SUCCESS).then(|| c.rest().to_vec()));
                }
                Ok(())
            }
            MSG_CHANNEL_OPEN => {
                let kind = c.utf8()?;
                let remote = c.u32()?;
                let window = c.u32()?;
                let max_packet = c.u32()?;
                let open = PendingOpen {
                    kind,
                    extra: c.rest().to_vec(),
                    remote,
                    window,
                    max_packet,
                    cmd: self.cmd.clone(),
                    answered: false,
                };
                let _ = self.incoming.send(Incoming::Open(open));
                Ok(())
            }
            MSG_CHANNEL_OPEN_CONFIRMATION => {
                let id = c.u32()?;
                let remote = c.u32()?;
                let window = c.u32()?;
                let max_packet = c.u32()?;
                match self.channels.remove(&id) {
                    Some(Slot::Opening(reply)) => {
                        let channel = self.establish(id, remote, window, max_packet);
                        let _ = reply.send(Ok(channel));
                        Ok(())
                    }
                    Some(open) => {
                        self.channels.insert(id, open);
                        Err(AttachError::protocol(format!("confirmation for open channel {}", id)))
                    }
                    None => Err(AttachError::protocol(format!("confirmation for unknown channel {}", id))),
                }
            }
            MSG_CHANNEL_OPEN_FAILURE => {
                let id = c.u32()?;
                let reason = OpenFailure::from(c.u32()?);
                let detail = c.utf8()?;
                if let Some(Slot::Opening(reply)) = self.channels.remove(&id) {
                    let _ = reply.send(Err(AttachError::OpenFailed { reason, detail }));
                }
                Ok(())
            }
            MSG_CHANNEL_WINDOW_ADJUST => {
                let id = c.u32()?;
                let n = c.u32()?;
                if let Some(open) = self.open(id) {
                    open.remote_window = open.remote_window.saturating_add(n);
                }
                self.flush(id).await
            }
            MSG_CHANNEL_DATA | MSG_CHANNEL_EXTENDED_DATA => {
                let id = c.u32()?;
                let stderr = msg == MSG_CHANNEL_EXTENDED_DATA;
                if stderr && c.u32()? != EXTENDED_DATA_STDERR {
                    return Ok(());
                }
                let data = c.string()?.to_vec();
                self.deliver(id, stderr, data).await
            }
            MSG_CHANNEL_EOF => {
                let id = c.u32()?;
                if let Some(open) = self.open(id) {
                    open.data_tx = None;
                    open.ext_tx = None;
                }
                Ok(())
            }
            MSG_CHANNEL_CLOSE => {
                let id = c.u32()?;
                if let Some(Slot::Open(mut open)) = self.channels.remove(&id) {
                    open.budget.close();
                    if !open.close_sent {
                        let mut close = vec![MSG_CHANNEL_CLOSE];
                        close.put_u32(open.remote);
                        self.writer.write(&close).await?;
                    }
                    open.outbound.clear();
                    debug!(channel = id, "channel closed");
                }
                Ok(())
            }
            MSG_CHANNEL_REQUEST => {
                let id = c.u32()?;
                let name = c.utf8()?;
                let want_reply = c.bool()?;
                let request = ChannelRequest {
                    name,
                    payload: c.rest().to_vec(),
                    id,
                    want_reply,
                    cmd: self.cmd.clone(),
                    answered: false,
                };
                match self.open(id).and_then(|o| o.req_tx.as_ref()) {
                    Some(tx) => {
                        let _ = tx.send(request);
                    }
                    // dropping the request answers it
                    None => drop(request),
                }
                Ok(())
            }
            MSG_CHANNEL_SUCCESS | MSG_CHANNEL_FAILURE => {
                let id = c.u32()?;
                if let Some(reply) = self.open(id).and_then(|o| o.pending.pop_front()) {
                    let _ = reply.send(msg == MSG_CHANNEL_SUCCESS);
                }
                Ok(())
            }
            MSG_UNIMPLEMENTED => {
                debug!("peer did not understand packet {}", c.u32().unwrap_or(0));
                Ok(())
            }
            other => {
                warn!("ignoring unexpected message {}", other);
                Ok(())
            }
        }
    }

    async fn command(&mut self, cmd: Cmd) -> Result<(), AttachError> {
        match cmd {
            Cmd::Open { kind, extra, reply } => {
                let id = self.allocate();
                self.channels.insert(id, Slot::Opening(reply));
                let mut open = vec![MSG_CHANNEL_OPEN];
                open.put_string(kind.as_bytes());
                open.put_u32(id);
                open.put_u32(WINDOW);
                open.put_u32(MAX_PACKET_DATA);
                open.extend_from_slice(&extra);
                self.writer.write(&open).await
            }
            Cmd::Confirm {
                remote,
                window,
                max_packet,
                reply,
            } => {
                let id = self.allocate();
                let channel = self.establish(id, remote, window, max_packet);
                let mut confirm = vec![MSG_CHANNEL_OPEN_CONFIRMATION];
                confirm.put_u32(remote);
                confirm.put_u32(id);
                confirm.put_u32(WINDOW);
                confirm.put_u32(MAX_PACKET_DATA);
                self.writer.write(&confirm).await?;
                let _ = reply.send(channel);
                Ok(())
            }
            Cmd::Reject { remote, reason, detail } => {
                let mut fail = vec![MSG_CHANNEL_OPEN_FAILURE];
                fail.put_u32(remote);
                fail.put_u32(reason.code());
                fail.put_string(detail.as_bytes());
                fail.put_string(b"");
                self.writer.write(&fail).await
            }
            Cmd::Global { name, payload, reply } => {
                self.pending_globals.push_back(reply);
                let mut req = vec![MSG_GLOBAL_REQUEST];
                req.put_string(name.as_bytes());
                req.put_bool(true);
                req.extend_from_slice(&payload);
                self.writer.write(&req).await
            }
            Cmd::GlobalReply { ok, payload } => {
                let mut reply = vec![if ok { MSG_REQUEST_SUCCESS } else { MSG_REQUEST_FAILURE }];
                if ok {
                    reply.extend_from_slice(&payload);
                }
                self.writer.write(&reply).await
            }
            Cmd::Data { id, stderr, data } => {
                match self.open(id) {
                    Some(open) if !open.eof_pending && !open.close_pending => {
                        open.outbound.push_back((stderr, data));
                    }
                    Some(open) => open.budget.release(data.len()),
                    None => {}
                }
                self.flush(id).await
            }
            Cmd::Consumed { id, n } => self.consumed(id, n).await,
            Cmd::Request {
                id,
                name,
                payload,
                reply,
            } => {
                let Some(open) = self.open(id) else {
                    return Ok(());
                };
                if open.close_sent {
                    return Ok(());
                }
                open.pending.push_back(reply);
                let mut req = vec![MSG_CHANNEL_REQUEST];
                req.put_u32(open.remote);
                req.put_string(name.as_bytes());
                req.put_bool(true);
                req.extend_from_slice(&payload);
                self.writer.write(&req).await
            }
            Cmd::RequestReply { id, ok } => {
                let Some(remote) = self.open(id).filter(|o| !o.close_sent).map(|o| o.remote) else {
                    return Ok(());
                };
                let mut reply = vec![if ok { MSG_CHANNEL_SUCCESS } else { MSG_CHANNEL_FAILURE }];
                reply.put_u32(remote);
                self.writer.write(&reply).await
            }
            Cmd::StopReading { id } => {
                if let Some(open) = self.open(id) {
                    open.data_tx = None;
                }
                Ok(())
            }
            Cmd::Eof { id } => {
                if let Some(open) = self.open(id) {
                    open.eof_pending = true;
                }
                self.flush(id).await
            }
            Cmd::Close { id } => {
                if let Some(open) = self.open(id) {
                    open.close_pending = true;
                }
                self.flush(id).await
            }
            // handled by the run loop
            Cmd::Disconnect => Ok(()),
        }
    }

    fn allocate(&mut self) -> u32 {
        while self.channels.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn open(&mut self, id: u32) -> Option<&mut Open> {
        match self.channels.get_mut(&id) {
            Some(Slot::Open(open)) => Some(open.as_mut()),
            _ => None,
        }
    }

    fn establish(&mut self, id: u32, remote: u32, window: u32, max_packet: u32) -> Channel {
        let (data_tx, data) = mpsc::unbounded_channel();
        let (ext_tx, ext) = mpsc::unbounded_channel();
        let (req_tx, requests) = mpsc::unbounded_channel();
        let budget = Budget::new();
        self.channels.insert(
            id,
            Slot::Open(Box::new(Open {
                remote,
                remote_window: window,
                remote_max: max_packet.clamp(1, MAX_PACKET_DATA),
                consumed: 0,
                data_tx: Some(data_tx),
                ext_tx: Some(ext_tx),
                req_tx: Some(req_tx),
                outbound: VecDeque::new(),
                budget: budget.clone(),
                pending: VecDeque::new(),
                eof_pending: false,
                eof_sent: false,
                close_pending: false,
                close_sent: false,
            })),
        );
        debug!(channel = id, remote, window, "channel open");
        Channel {
            id,
            cmd: self.cmd.clone(),
            budget,
            guard: Arc::new(CloseGuard {
                id,
                cmd: self.cmd.clone(),
            }),
            data: Some(data),
            ext: Some(ext),
            requests: Some(requests),
        }
    }

    async fn deliver(&mut self, id: u32, stderr: bool, data: Vec<u8>) -> Result<(), AttachError> {
        let n = data.len();
        let Some(open) = self.open(id) else {
            return Ok(());
        };
        let tx = if stderr { &open.ext_tx } else { &open.data_tx };
        let delivered = tx.as_ref().is_some_and(|tx| tx.send(data).is_ok());
        if delivered {
            Ok(())
        } else {
            // nobody will read it, so acknowledge it now
            self.consumed(id, n).await
        }
    }

    async fn consumed(&mut self, id: u32, n: usize) -> Result<(), AttachError> {
        let Some(open) = self.open(id) else {
            return Ok(());
        };
        open.consumed += n;
        if open.consumed < WINDOW as usize / 2 || open.close_sent {
            return Ok(());
        }
        let mut adjust = vec![MSG_CHANNEL_WINDOW_ADJUST];
        adjust.put_u32(open.remote);
        adjust.put_u32(open.consumed as u32);
        open.consumed = 0;
        self.writer.write(&adjust).await
    }

    /// Send queued data the peer's window allows, then any pending EOF or
    /// CLOSE once the queue is empty.
    async fn flush(&mut self, id: u32) -> Result<(), AttachError> {
        let Some(Slot::Open(open)) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        while open.remote_window > 0 {
            let Some((stderr, mut data)) = open.outbound.pop_front() else {
                break;
            };
            let n = data.len().min(open.remote_window as usize).min(open.remote_max as usize);
            if n < data.len() {
                let rest = data.split_off(n);
                open.outbound.push_front((stderr, rest));
            }

            let mut msg = Vec::with_capacity(n + 16);
            if stderr {
                msg.put_u8(MSG_CHANNEL_EXTENDED_DATA);
                msg.put_u32(open.remote);
                msg.put_u32(EXTENDED_DATA_STDERR);
            } else {
                msg.put_u8(MSG_CHANNEL_DATA);
                msg.put_u32(open.remote);
            }
            msg.put_string(&data);
            self.writer.write(&msg).await?;
            open.remote_window -= n as u32;
            open.budget.release(n);
        }

        if !open.outbound.is_empty() {
            return Ok(());
        }
        if open.eof_pending && !open.eof_sent {
            let mut eof = vec![MSG_CHANNEL_EOF];
            eof.put_u32(open.remote);
            self.writer.write(&eof).await?;
            open.eof_sent = true;
        }
        if open.close_pending && !open.close_sent {
            let mut close = vec![MSG_CHANNEL_CLOSE];
            close.put_u32(open.remote);
            self.writer.write(&close).await?;
            open.close_sent = true;
            open.budget.close();
            debug!(channel = id, "sent channel close");
        }
        Ok(())
    }
}

/// An authenticated SSH connection with a running driver.
pub struct Connection {
    cmd: mpsc::UnboundedSender<Cmd>,
    incoming: mpsc::UnboundedReceiver<Incoming>,
    driver: JoinHandle<Result<(), AttachError>>,
}

impl Connection {
    /// Serve one connection on an already synchronized stream.
    pub async fn accept<S>(stream: S, key: &HostKey) -> Result<Self, AttachError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut transport = Transport::accept(stream, key).await?;
        auth::serve(&mut transport).await?;
        Ok(Self::spawn(transport))
    }

    /// Connect as the client role. Returns the server's host key blob too.
    pub async fn connect<S>(stream: S, user: &str, password: &str) -> Result<(Self, Vec<u8>), AttachError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut transport, host_key) = Transport::connect(stream).await?;
        auth::login(&mut transport, user, password).await?;
        Ok((Self::spawn(transport), host_key))
    }

    fn spawn<S>(transport: Transport<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let Transport { reader, writer, .. } = transport;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();

        let reading = tokio::spawn(read_packets(reader, packet_tx));
        let driver = Driver::<WriteHalf<S>> {
            writer,
            cmd: cmd_tx.clone(),
            incoming: incoming_tx,
            channels: HashMap::new(),
            next_id: 0,
            pending_globals: VecDeque::new(),
        };
        let driver = tokio::spawn(async move {
            let result = driver.run(packet_rx, cmd_rx).await;
            reading.abort();
            result
        });

        Self {
            cmd: cmd_tx,
            incoming,
            driver,
        }
    }

    /// The next request or channel open from the peer. `None` once the
    /// connection has ended.
    pub async fn next(&mut self) -> Option<Incoming> {
        self.incoming.recv().await
    }

    /// Send a global request; `None` if the peer refused it.
    pub async fn global_request(&self, name: &str, payload: Vec<u8>) -> Result<Option<Vec<u8>>, AttachError> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(Cmd::Global {
                name: name.to_string(),
                payload,
                reply,
            })
            .map_err(|_| AttachError::Closed)?;
        rx.await.map_err(|_| AttachError::Closed)
    }

    pub async fn open_channel(&self, kind: &str, extra: &[u8]) -> Result<Channel, AttachError> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(Cmd::Open {
                kind: kind.to_string(),
                extra: extra.to_vec(),
                reply,
            })
            .map_err(|_| AttachError::Closed)?;
        rx.await.map_err(|_| AttachError::Closed)?
    }

    pub fn disconnect(&self) {
        let _ = self.cmd.send(Cmd::Disconnect);
    }

    /// Wait for the connection to end.
    pub async fn closed(self) -> Result<(), AttachError> {
        drop(self.incoming);
        match self.driver.await {
            Ok(result) => result,
            Err(e) => Err(AttachError::protocol(format!("connection driver failed: {}", e))),
        }
    }
}

async fn read_packets<R: AsyncRead + Unpin>(
    mut reader: PacketReader<R>,
    packets: mpsc::UnboundedSender<Result<Vec<u8>, AttachError>>,
) {
    loop {
        let packet = reader.read().await;
        let failed = packet.is_err();
        if packets.send(packet).is_err() || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (Connection, Connection) {
        let key = HostKey::generate();
        let (a, b) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(async move { Connection::accept(a, &key).await });
        let (client, _) = Connection::connect(b, auth::USER, "").await.unwrap();
        (server.await.unwrap().unwrap(), client)
    }

    #[tokio::test]
    async fn test_global_request_reply() {
        let (mut server, client) = pair().await;
        tokio::spawn(async move {
            while let Some(Incoming::Global(req)) = server.next().await {
                let ok = req.name == "ping";
                req.reply(ok, b"pong".to_vec());
            }
        });
        assert_eq!(client.global_request("ping", Vec::new()).await.unwrap(), Some(b"pong".to_vec()));
        assert_eq!(client.global_request("other", Vec::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_rejected_with_reason() {
        let (mut server, client) = pair().await;
        tokio::spawn(async move {
            while let Some(incoming) = server.next().await {
                if let Incoming::Open(open) = incoming {
                    open.reject(OpenFailure::Prohibited, "not here");
                }
            }
        });
        match client.open_channel("attach", b"x").await {
            Err(AttachError::OpenFailed { reason, detail }) => {
                assert_eq!(reason, OpenFailure::Prohibited);
                assert_eq!(detail, "not here");
            }
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("open should have failed"),
        }
    }

    #[tokio::test]
    async fn test_unhandled_open_is_refused() {
        let (server, client) = pair().await;
        // nobody services incoming events
        drop(server.incoming);
        assert!(matches!(
            client.open_channel("attach", b"x").await,
            Err(AttachError::OpenFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_data_both_ways_and_requests() {
        let (mut server, client) = pair().await;
        let served = tokio::spawn(async move {
            let Some(Incoming::Open(open)) = server.next().await else {
                panic!("expected an open");
            };
            assert_eq!(open.kind, "attach");
            assert_eq!(open.extra, b"tee1");
            let mut channel = open.accept().await.unwrap();
            let mut requests = channel.take_requests().unwrap();

            let echoed = channel.read().await.unwrap();
            channel.write(&echoed).await.unwrap();
            channel.write_stderr(b"err").await.unwrap();

            let req = requests.recv().await.unwrap();
            assert_eq!(req.name, "close-stdin");
            req.reply(true);
            let req = requests.recv().await.unwrap();
            assert_eq!(req.name, "bogus");
            drop(req);
            (server, channel)
        });

        let mut channel = client.open_channel("attach", b"tee1").await.unwrap();
        channel.write(b"hello world!\n").await.unwrap();
        assert_eq!(channel.read().await.unwrap(), b"hello world!\n");
        assert_eq!(channel.read_stderr().await.unwrap(), b"err");
        assert!(channel.request("close-stdin", Vec::new()).await.unwrap());
        assert!(!channel.request("bogus", Vec::new()).await.unwrap());

        let (_server, server_channel) = served.await.unwrap();
        drop(server_channel);
        assert_eq!(channel.read().await, None);
    }

    #[tokio::test]
    async fn test_sync_endpoints_with_flow_control() {
        let (mut server, client) = pair().await;
        let served = tokio::spawn(async move {
            let Some(Incoming::Open(open)) = server.next().await else {
                panic!("expected an open");
            };
            let mut channel = open.accept().await.unwrap();
            let (mut reader, stop) = channel.take_reader().unwrap();
            let mut writer = channel.writer();
            drop(channel);
            tokio::task::spawn_blocking(move || {
                // more than one window's worth
                let mut total = 0usize;
                let mut buf = [0u8; 8192];
                while total < 3 * WINDOW as usize {
                    let n = reader.read(&mut buf).unwrap();
                    assert!(n > 0);
                    total += n;
                }
                writer.write_all(b"done").unwrap();
                stop();
                assert_eq!(reader.read(&mut buf).unwrap(), 0);
                drop(writer);
            })
            .await
            .unwrap();
            server
        });

        let mut channel = client.open_channel("attach", b"").await.unwrap();
        let chunk = vec![b'x'; MAX_PACKET_DATA as usize];
        for _ in 0..(3 * WINDOW / MAX_PACKET_DATA) {
            channel.write(&chunk).await.unwrap();
        }
        assert_eq!(channel.read().await.unwrap(), b"done");
        assert_eq!(channel.read().await, None);
        let _server = served.await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_sees_eof_after_peer_close() {
        let (mut server, client) = pair().await;
        let served = tokio::spawn(async move {
            let Some(Incoming::Open(open)) = server.next().await else {
                panic!("expected an open");
            };
            let channel = open.accept().await.unwrap();
            (server, channel.writer())
        });
        let channel = client.open_channel("attach", b"").await.unwrap();
        let (_server, mut writer) = served.await.unwrap();
        channel.close().unwrap();

        let err = tokio::task::spawn_blocking(move || loop {
            if let Err(e) = writer.write(b"x") {
                return e;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        })
        .await
        .unwrap();
        assert!(vigil_dio::is_eof(&err));
    }
}
