use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Membership token returned by [`MultiWriter::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriterId(u64);

enum Endpoint {
    /// Agent stdout/stderr. Shared with logging, so never closed.
    Standard(Box<dyn Write + Send>),
    Owned(Box<dyn Write + Send>),
}

impl Endpoint {
    fn writer(&mut self) -> &mut (dyn Write + Send) {
        match self {
            Endpoint::Standard(w) => w.as_mut(),
            Endpoint::Owned(w) => w.as_mut(),
        }
    }
}

type Slot = Arc<Mutex<Option<Endpoint>>>;

#[derive(Default)]
struct WriterSet {
    next: u64,
    writers: Vec<(WriterId, Slot)>,
}

/// A writer that duplicates every write to a dynamic set of endpoints.
///
/// An endpoint that reports EOF is dropped from the set and the write carries
/// on with the others. Any other error aborts the write and is returned.
#[derive(Default)]
pub struct MultiWriter {
    set: Mutex<WriterSet>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MultiWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint that is closed (dropped) by [`MultiWriter::close`].
    pub fn add<W: Write + Send + 'static>(&self, writer: W) -> WriterId {
        self.insert(Endpoint::Owned(Box::new(writer)))
    }

    /// Add one of the agent's own standard output handles.
    ///
    /// These survive [`MultiWriter::close`].
    pub fn add_standard<W: Write + Send + 'static>(&self, writer: W) -> WriterId {
        self.insert(Endpoint::Standard(Box::new(writer)))
    }

    fn insert(&self, endpoint: Endpoint) -> WriterId {
        let mut set = lock(&self.set);
        let id = WriterId(set.next);
        set.next += 1;
        set.writers.push((id, Arc::new(Mutex::new(Some(endpoint)))));
        tracing::debug!("[{:p}] added writer - now {} writers", self, set.writers.len());
        id
    }

    /// Remove an endpoint. Removing an unknown id is not an error.
    ///
    /// Once this returns the endpoint receives no further bytes, even from a
    /// write that is already in flight.
    pub fn remove(&self, id: WriterId) -> bool {
        let slot = {
            let mut set = lock(&self.set);
            let Some(pos) = set.writers.iter().position(|(w, _)| *w == id) else {
                return false;
            };
            let (_, slot) = set.writers.remove(pos);
            tracing::debug!("[{:p}] removed writer - now {} writers", self, set.writers.len());
            slot
        };
        lock(&slot).take();
        true
    }

    pub fn len(&self) -> usize {
        lock(&self.set).writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every endpoint except the agent's standard output handles.
    pub fn close(&self) {
        let mut set = lock(&self.set);
        tracing::debug!("[{:p}] close on {} writers", self, set.writers.len());
        set.writers.retain(|(_, slot)| {
            let mut endpoint = lock(slot);
            match endpoint.as_mut() {
                Some(Endpoint::Standard(w)) => {
                    let _ = w.flush();
                    true
                }
                Some(Endpoint::Owned(_)) => {
                    endpoint.take();
                    false
                }
                None => false,
            }
        });
    }

    fn snapshot(&self) -> Vec<(WriterId, Slot)> {
        lock(&self.set).writers.clone()
    }

    fn write_all_endpoints(&self, buf: &[u8]) -> io::Result<usize> {
        // never write twice to one endpoint if the set changes under us
        for (id, slot) in self.snapshot() {
            let result = {
                let mut endpoint = lock(&slot);
                match endpoint.as_mut() {
                    Some(e) => e.writer().write(buf),
                    None => continue,
                }
            };

            match result {
                Ok(n) if n == buf.len() => {}
                Ok(n) => {
                    tracing::debug!("[{:p}] short write ({} of {})", self, n, buf.len());
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
                }
                Err(e) if crate::is_eof(&e) => {
                    tracing::debug!("[{:p}] removing writer due to EOF", self);
                    self.remove(id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(buf.len())
    }

    fn flush_all_endpoints(&self) -> io::Result<()> {
        for (_, slot) in self.snapshot() {
            if let Some(e) = lock(&slot).as_mut() {
                e.writer().flush()?;
            }
        }
        Ok(())
    }
}

impl Write for &MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all_endpoints(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_all_endpoints()
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all_endpoints(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_all_endpoints()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn bytes(&self) -> Vec<u8> {
            lock(&self.0).clone()
        }
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Accepts `budget` writes, then reports EOF forever.
    struct EofAfter {
        budget: usize,
        seen: Capture,
    }

    impl Write for EofAfter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "closed"));
            }
            self.budget -= 1;
            self.seen.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Half;

    impl Write for Half {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len() / 2)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_reaches_every_endpoint() {
        let mw = MultiWriter::new();
        let a = Capture::default();
        let b = Capture::default();
        mw.add(a.clone());
        mw.add(b.clone());

        (&mw).write_all(b"hello").unwrap();
        assert_eq!(a.bytes(), b"hello");
        assert_eq!(b.bytes(), b"hello");
    }

    #[test]
    fn test_eof_endpoint_is_dropped() {
        let mw = MultiWriter::new();
        let eof_seen = Capture::default();
        let other = Capture::default();
        mw.add(EofAfter {
            budget: 1,
            seen: eof_seen.clone(),
        });
        mw.add(other.clone());

        (&mw).write_all(b"one").unwrap();
        (&mw).write_all(b"two").unwrap();
        (&mw).write_all(b"three").unwrap();

        assert_eq!(eof_seen.bytes(), b"one");
        assert_eq!(other.bytes(), b"onetwothree");
        assert_eq!(mw.len(), 1);
    }

    #[test]
    fn test_short_write_is_an_error() {
        let mw = MultiWriter::new();
        mw.add(Half);
        let err = (&mw).write(b"abcd").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(err.to_string(), "short write");
    }

    #[test]
    fn test_remove_stops_delivery() {
        let mw = MultiWriter::new();
        let a = Capture::default();
        let id = mw.add(a.clone());
        (&mw).write_all(b"x").unwrap();
        assert!(mw.remove(id));
        assert!(!mw.remove(id));
        (&mw).write_all(b"y").unwrap();
        assert_eq!(a.bytes(), b"x");
    }

    #[test]
    fn test_close_keeps_standard_handles() {
        let mw = MultiWriter::new();
        let owned = Capture::default();
        let standard = Capture::default();
        mw.add(owned.clone());
        mw.add_standard(standard.clone());

        mw.close();
        assert_eq!(mw.len(), 1);

        (&mw).write_all(b"after").unwrap();
        assert_eq!(owned.bytes(), b"");
        assert_eq!(standard.bytes(), b"after");
    }

    #[test]
    fn test_add_during_concurrent_writes() {
        let mw = Arc::new(MultiWriter::new());
        let first = Capture::default();
        mw.add(first.clone());

        let writer = {
            let mw = mw.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    (&*mw).write_all(b".").unwrap();
                }
            })
        };

        let late = Capture::default();
        mw.add(late.clone());
        writer.join().unwrap();
        (&*mw).write_all(b"!").unwrap();

        assert_eq!(first.bytes().len(), 1001);
        let late_bytes = late.bytes();
        assert_eq!(late_bytes.last(), Some(&b'!'));
    }
}
