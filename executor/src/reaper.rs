//! Process-wide child reaper.
//!
//! While anyone is subscribed, one thread waits for SIGCHLD and collects
//! every exited child with `waitpid(-1, WNOHANG)`. Exits are offered to the
//! registered subscribers; one nobody claims was adopted through the
//! subreaper attribute and is just logged.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, RwLockReadGuard, Weak};
use std::thread;

use nix::errno::Errno;
use nix::sys::signal::{Signal, raise};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use signal_hook::consts::SIGCHLD;
use signal_hook::iterator::{Handle, Signals};

use crate::ExecutorError;

const ADOPTED_HISTORY: usize = 64;

pub trait ReapSubscriber: Send + Sync {
    /// Offered every reaped child. Return `true` to claim it.
    ///
    /// `status` is the exit code, or -1 when the child was killed by a signal.
    fn reaped(&self, pid: i32, status: i32) -> bool;
}

/// Held while starting a child and recording its pid. The reaper takes the
/// write side for each pass, so a child cannot be collected before its owner
/// knows about it.
static SPAWN_GUARD: RwLock<()> = RwLock::new(());

pub fn spawn_guard() -> RwLockReadGuard<'static, ()> {
    SPAWN_GUARD
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Reaper {
    registry: Mutex<Registry>,
    next: AtomicU64,
    adopted: Mutex<VecDeque<i32>>,
}

struct Registry {
    subscribers: Vec<(u64, Weak<dyn ReapSubscriber>)>,
    /// Set while a reaper thread is consuming SIGCHLD.
    running: Option<Handle>,
}

/// Keeps a subscriber registered until dropped. Dropping the last one stops
/// the reaper thread.
pub struct Subscription {
    id: u64,
    reaper: &'static Reaper,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut registry = lock(&self.reaper.registry);
        registry.subscribers.retain(|(id, _)| *id != self.id);
        if registry.subscribers.is_empty() {
            Reaper::shutdown(&mut registry);
        }
    }
}

impl Reaper {
    /// The process-wide reaper. Its thread runs while anyone is subscribed.
    pub fn global() -> Result<&'static Reaper, ExecutorError> {
        static REAPER: OnceLock<Reaper> = OnceLock::new();
        static INIT: Mutex<()> = Mutex::new(());

        if let Some(r) = REAPER.get() {
            return Ok(r);
        }
        let _init = lock(&INIT);
        if let Some(r) = REAPER.get() {
            return Ok(r);
        }

        if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(REAPER.get_or_init(|| Reaper {
            registry: Mutex::new(Registry {
                subscribers: Vec::new(),
                running: None,
            }),
            next: AtomicU64::new(0),
            adopted: Mutex::new(VecDeque::new()),
        }))
    }

    pub fn subscribe(&'static self, subscriber: Arc<dyn ReapSubscriber>) -> Result<Subscription, ExecutorError> {
        let mut registry = lock(&self.registry);
        if registry.running.is_none() {
            registry.running = Some(self.spawn()?);
        }
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        registry.subscribers.push((id, Arc::downgrade(&subscriber)));
        Ok(Subscription { id, reaper: self })
    }

    fn spawn(&'static self) -> Result<Handle, ExecutorError> {
        let mut signals = Signals::new([SIGCHLD])?;
        let handle = signals.handle();
        thread::Builder::new()
            .name("vigil-reaper".into())
            .spawn(move || {
                for _ in signals.forever() {
                    match panic::catch_unwind(AssertUnwindSafe(|| self.pass())) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!("waitpid failed: {}", e),
                        Err(_) => tracing::error!("reaper pass panicked, waiting for next SIGCHLD"),
                    }
                }
                tracing::info!("child reaper stopped");
            })?;

        tracing::info!("Started reaping child processes");
        Ok(handle)
    }

    /// Deliver a synthetic SIGCHLD so children that exited before the handler
    /// existed are collected.
    pub fn prime(&self) -> Result<(), ExecutorError> {
        raise(Signal::SIGCHLD)?;
        Ok(())
    }

    /// A reaper thread is consuming SIGCHLD.
    pub fn is_running(&self) -> bool {
        lock(&self.registry).running.is_some()
    }

    fn shutdown(registry: &mut Registry) {
        if let Some(handle) = registry.running.take() {
            tracing::info!("Shutting down reaper");
            handle.close();
        }
    }

    /// Recently reaped pids that no subscriber claimed, oldest first.
    pub fn adopted(&self) -> Vec<i32> {
        lock(&self.adopted).iter().copied().collect()
    }

    fn pass(&self) -> Result<(), Errno> {
        let _exclusive = SPAWN_GUARD
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        loop {
            let (pid, status) = match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => {
                    tracing::trace!("No more child processes to reap");
                    return Ok(());
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
                Ok(WaitStatus::Exited(pid, code)) => (pid.as_raw(), code),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    tracing::debug!(pid = pid.as_raw(), "killed by {}", signal);
                    (pid.as_raw(), -1)
                }
                Ok(other) => {
                    tracing::debug!("non-exit status change: {:?}", other);
                    continue;
                }
            };

            tracing::debug!(pid, status, "reaped process");
            self.dispatch(pid, status);
        }
    }

    fn dispatch(&self, pid: i32, status: i32) {
        let subscribers: Vec<Arc<dyn ReapSubscriber>> = lock(&self.registry)
            .subscribers
            .iter()
            .filter_map(|(_, s)| s.upgrade())
            .collect();

        if subscribers.iter().any(|s| s.reaped(pid, status)) {
            return;
        }

        tracing::info!(pid, status, "Reaped adopted zombie process");
        let mut adopted = lock(&self.adopted);
        adopted.push_back(pid);
        while adopted.len() > ADOPTED_HISTORY {
            adopted.pop_front();
        }
    }
}
