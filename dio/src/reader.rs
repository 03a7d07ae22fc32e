use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::unistd::pipe2;

/// How long a pump waits for pipe space before re-checking membership.
const FULL_PIPE_WAIT: Duration = Duration::from_millis(20);

/// Membership token returned by [`MultiReader::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderId(u64);

type Closer = Box<dyn FnOnce() + Send>;

struct Source {
    id: ReaderId,
    closer: Option<Closer>,
}

#[derive(Default)]
struct State {
    next: u64,
    /// In add order. The head holds the floor.
    sources: Vec<Source>,
    /// Bytes written to the pipe and not yet read back.
    buffered: usize,
    closed: bool,
}

impl State {
    fn contains(&self, id: ReaderId) -> bool {
        self.sources.iter().any(|s| s.id == id)
    }

    fn is_head(&self, id: ReaderId) -> bool {
        self.sources.first().is_some_and(|s| s.id == id)
    }
}

struct Shared {
    // lock order: tx before state. tx is non-blocking and never held
    // while waiting for pipe space.
    tx: Mutex<Option<File>>,
    state: Mutex<State>,
    cond: Condvar,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A reader that merges a dynamic set of sources into one stream.
///
/// Each source is pumped by its own thread into an internal pipe. Sources
/// are drained in the order they were added: a later source's bytes follow
/// once every earlier one has hit EOF or been removed. With no sources and
/// nothing buffered, `read` blocks until a source is added or the reader is
/// closed. End-of-stream is only ever reported after [`MultiReader::close`].
pub struct MultiReader {
    shared: Arc<Shared>,
    rx: Mutex<File>,
}

impl MultiReader {
    pub fn new() -> io::Result<Self> {
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        fcntl(tx.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(io::Error::from)?;
        Ok(Self {
            shared: Arc::new(Shared {
                tx: Mutex::new(Some(File::from(tx))),
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
            }),
            rx: Mutex::new(File::from(rx)),
        })
    }

    /// Add a source with no way to interrupt it.
    pub fn add<R: Read + Send + 'static>(&self, reader: R) -> ReaderId {
        self.insert(reader, None)
    }

    /// Add a source along with a hook that interrupts or closes it.
    ///
    /// The hook runs on [`MultiReader::close`].
    pub fn add_closable<R, F>(&self, reader: R, closer: F) -> ReaderId
    where
        R: Read + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.insert(reader, Some(Box::new(closer)))
    }

    fn insert<R: Read + Send + 'static>(&self, reader: R, closer: Option<Closer>) -> ReaderId {
        let id = {
            let mut state = lock(&self.shared.state);
            let id = ReaderId(state.next);
            state.next += 1;
            state.sources.push(Source { id, closer });
            tracing::debug!(
                "[{:p}] added reader - now {} readers",
                Arc::as_ptr(&self.shared),
                state.sources.len()
            );
            id
        };
        self.shared.cond.notify_all();

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("dio-pump".into())
            .spawn(move || pump(shared, id, reader));
        if let Err(e) = spawned {
            tracing::error!("failed to start reader pump: {}", e);
            self.remove(id);
        }
        id
    }

    /// Remove a source. Once this returns none of its bytes are forwarded.
    pub fn remove(&self, id: ReaderId) -> bool {
        remove_source(&self.shared, id)
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.state).sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every closable source and end the merged stream.
    pub fn close(&self) {
        let closers: Vec<Closer> = {
            let mut tx = lock(&self.shared.tx);
            let mut state = lock(&self.shared.state);
            state.closed = true;
            tx.take();
            tracing::debug!(
                "[{:p}] close on {} readers",
                Arc::as_ptr(&self.shared),
                state.sources.len()
            );
            state
                .sources
                .drain(..)
                .filter_map(|s| s.closer)
                .collect()
        };
        self.shared.cond.notify_all();
        for close in closers {
            close();
        }
    }

    fn read_merged(&self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = lock(&self.shared.state);
            while state.sources.is_empty() && state.buffered == 0 && !state.closed {
                state = self
                    .shared
                    .cond
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            if state.closed && state.buffered == 0 {
                return Ok(0);
            }
        }

        let n = lock(&self.rx).read(buf)?;
        {
            let mut state = lock(&self.shared.state);
            state.buffered = state.buffered.saturating_sub(n);
        }
        // pumps waiting on a full pipe
        self.shared.cond.notify_all();
        Ok(n)
    }
}

fn remove_source(shared: &Shared, id: ReaderId) -> bool {
    let removed = {
        let _tx = lock(&shared.tx);
        let mut state = lock(&shared.state);
        match state.sources.iter().position(|s| s.id == id) {
            Some(pos) => {
                state.sources.remove(pos);
                tracing::debug!(
                    "[{:p}] removed reader - now {} readers",
                    shared,
                    state.sources.len()
                );
                true
            }
            None => false,
        }
    };
    if removed {
        shared.cond.notify_all();
    }
    removed
}

fn pump<R: Read>(shared: Arc<Shared>, id: ReaderId, mut reader: R) {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("reader pump ending on error: {}", e);
                break;
            }
        };

        {
            let mut state = lock(&shared.state);
            while state.contains(id) && !state.is_head(id) && !state.closed {
                state = shared
                    .cond
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }

        if !forward(&shared, id, &buf[..n]) {
            break;
        }
    }

    remove_source(&shared, id);
}

/// Write `data` into the pipe on behalf of source `id`. Returns false once
/// the source is gone, the reader is closed or the pipe failed.
fn forward(shared: &Shared, id: ReaderId, mut data: &[u8]) -> bool {
    while !data.is_empty() {
        let result = {
            let tx = lock(&shared.tx);
            let Some(mut pipe) = tx.as_ref() else {
                return false;
            };
            {
                let mut state = lock(&shared.state);
                if state.closed || !state.contains(id) {
                    return false;
                }
                state.buffered += data.len();
            }
            let result = pipe.write(data);
            let written = *result.as_ref().unwrap_or(&0);
            let mut state = lock(&shared.state);
            state.buffered = state.buffered.saturating_sub(data.len() - written);
            result
        };

        match result {
            Ok(0) => return false,
            Ok(written) => {
                data = &data[written..];
                shared.cond.notify_all();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let state = lock(&shared.state);
                if state.closed || !state.contains(id) {
                    return false;
                }
                let _ = shared.cond.wait_timeout(state, FULL_PIPE_WAIT);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!("reader pump failed to forward: {}", e);
                return false;
            }
        }
    }
    true
}

impl Read for &MultiReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_merged(buf)
    }
}

impl Read for MultiReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_merged(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Reads forwarded from a channel, EOF when the sender is dropped.
    struct Feed {
        rx: mpsc::Receiver<Vec<u8>>,
    }

    impl Read for Feed {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.rx.recv() {
                Ok(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Err(_) => Ok(0),
            }
        }
    }

    fn read_exact_len(mr: &MultiReader, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        (&*mr).read_exact(&mut out).unwrap();
        out
    }

    #[test]
    fn test_concatenates_in_add_order() {
        let mr = MultiReader::new().unwrap();
        let parts: Vec<Vec<u8>> = (0..4u8).map(|i| vec![b'a' + i; 10_000]).collect();
        for p in &parts {
            mr.add(Cursor::new(p.clone()));
        }

        let got = read_exact_len(&mr, 40_000);
        assert_eq!(got, parts.concat());
    }

    #[test]
    fn test_finished_sources_leave_the_set() {
        let mr = MultiReader::new().unwrap();
        mr.add(Cursor::new(b"abc".to_vec()));
        assert_eq!(read_exact_len(&mr, 3), b"abc");

        for _ in 0..100 {
            if mr.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(mr.is_empty());
    }

    #[test]
    fn test_read_blocks_until_a_source_arrives() {
        let mr = Arc::new(MultiReader::new().unwrap());
        let (done_tx, done_rx) = mpsc::channel();
        {
            let mr = mr.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                let n = (&*mr).read(&mut buf).unwrap();
                done_tx.send(buf[..n].to_vec()).unwrap();
            });
        }

        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
        mr.add(Cursor::new(b"late".to_vec()));
        let got = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, b"late");
    }

    #[test]
    fn test_removed_source_is_not_forwarded() {
        let mr = MultiReader::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let id = mr.add(Feed { rx });

        tx.send(b"first".to_vec()).unwrap();
        assert_eq!(read_exact_len(&mr, 5), b"first");

        assert!(mr.remove(id));
        let _ = tx.send(b"second".to_vec());

        mr.add(Cursor::new(b"other".to_vec()));
        assert_eq!(read_exact_len(&mr, 5), b"other");
    }

    #[test]
    fn test_close_ends_stream_and_runs_closers() {
        let mr = MultiReader::new().unwrap();
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let (closed_tx, closed_rx) = mpsc::channel();
        mr.add_closable(Feed { rx }, move || {
            drop(tx);
            closed_tx.send(()).unwrap();
        });

        mr.close();
        closed_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!((&mr).read(&mut buf).unwrap(), 0);
        assert!(mr.is_empty());
    }

    /// Runs `f` on a thread and fails if it has not returned within 5s.
    fn returns_promptly(what: &str, f: impl FnOnce() + Send + 'static) {
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            f();
            let _ = done_tx.send(());
        });
        assert!(
            done_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
            "{} blocked on an unread backlog",
            what
        );
    }

    fn with_backlog() -> (Arc<MultiReader>, ReaderId) {
        let mr = Arc::new(MultiReader::new().unwrap());
        let id = mr.add(Cursor::new(vec![b'x'; 256 * 1024]));
        // let the pump fill the pipe
        thread::sleep(Duration::from_millis(200));
        (mr, id)
    }

    #[test]
    fn test_close_with_unread_backlog() {
        let (mr, _) = with_backlog();
        let closing = mr.clone();
        returns_promptly("close", move || closing.close());

        for _ in 0..100 {
            if mr.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(mr.is_empty());
    }

    #[test]
    fn test_remove_with_unread_backlog() {
        let (mr, id) = with_backlog();
        let removing = mr.clone();
        returns_promptly("remove", move || assert!(removing.remove(id)));
        assert!(mr.is_empty());

        // what was already forwarded can still be drained
        let mut buf = vec![0u8; 1024];
        let n = (&*mr).read(&mut buf).unwrap();
        assert!(n > 0);
        assert!(buf[..n].iter().all(|&b| b == b'x'));
    }
}
