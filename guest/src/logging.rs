//! Agent log output.
//!
//! Everything goes to stdout through a `tracing-subscriber` fmt layer. Once
//! the executor opens the platform debug sink (a serial console by default)
//! every line is copied there too. The configured debug level swaps the
//! filter through a reload handle.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};
use vigil_executor::{ExecutorError, LogControl};

use crate::GuestError;

/// Second destination for log lines, empty until opened.
#[derive(Clone, Default)]
pub struct DebugSink(Arc<Mutex<Option<File>>>);

impl DebugSink {
    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn attach(&self, file: File) {
        *self.lock() = Some(file);
    }

    pub fn is_attached(&self) -> bool {
        self.lock().is_some()
    }
}

pub struct TeeWriter {
    sink: DebugSink,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        let mut sink = self.sink.lock();
        if let Some(file) = sink.as_mut() {
            // A sink that stops taking writes is dropped; stdout carries on.
            if file.write_all(buf).is_err() {
                *sink = None;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

impl<'a> MakeWriter<'a> for DebugSink {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter { sink: self.clone() }
    }
}

/// Filter for a configured debug level: 0 keeps the startup filter.
fn directive(base: &str, debug_level: i32) -> &str {
    match debug_level {
        i32::MIN..=0 => base,
        1 => "debug",
        _ => "trace",
    }
}

pub struct Logging {
    filter: reload::Handle<EnvFilter, Registry>,
    /// Startup filter, from `RUST_LOG` or `info`.
    base: String,
    level: Mutex<i32>,
    sink: DebugSink,
    sink_path: Option<PathBuf>,
}

impl Logging {
    /// Install the process-wide subscriber.
    pub fn init(sink_path: Option<PathBuf>) -> Result<Arc<Self>, GuestError> {
        let base = std::env::var(EnvFilter::DEFAULT_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());
        let (filter, handle) = reload::Layer::new(EnvFilter::new(&base));
        let sink = DebugSink::default();

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(false).with_writer(sink.clone()))
            .try_init()
            .map_err(|e| GuestError::Logging(e.to_string()))?;

        Ok(Arc::new(Self::with_handle(handle, base, sink, sink_path)))
    }

    fn with_handle(
        filter: reload::Handle<EnvFilter, Registry>,
        base: String,
        sink: DebugSink,
        sink_path: Option<PathBuf>,
    ) -> Self {
        Self {
            filter,
            base,
            level: Mutex::new(0),
            sink,
            sink_path,
        }
    }
}

impl LogControl for Logging {
    fn open_sink(&self) -> Result<(), ExecutorError> {
        let Some(path) = &self.sink_path else {
            return Ok(());
        };
        let file = OpenOptions::new().append(true).open(path)?;
        self.sink.attach(file);
        info!("copying log output to {:?}", path);
        Ok(())
    }

    fn set_level(&self, debug_level: i32) {
        let mut level = self.level.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *level == debug_level {
            return;
        }
        let wanted = directive(&self.base, debug_level);
        match self.filter.reload(EnvFilter::new(wanted)) {
            Ok(()) => {
                *level = debug_level;
                info!("log filter set to {} (debug level {})", wanted, debug_level);
            }
            Err(e) => warn!("unable to change log filter: {}", e),
        }
    }
}
