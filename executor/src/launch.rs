//! Starting a session's process and wiring its stdio.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vigil_dio::{MultiReader, MultiWriter};

use crate::config::SessionConfig;
use crate::executor::{Executor, SessionRef};
use crate::lookpath::lookpath;
use crate::pty;
use crate::reaper::spawn_guard;
use crate::session::{Session, SessionIo};
use crate::user::{self, Credential};
use crate::ExecutorError;

/// Parent-side ends of a freshly started process.
enum Wiring {
    Pipes {
        stdin: Option<std::process::ChildStdin>,
        stdout: Option<std::process::ChildStdout>,
        stderr: Option<std::process::ChildStderr>,
    },
    Pty(Arc<File>),
}

impl Executor {
    /// Launch one session. A session whose launch gate is still closed when
    /// the executor stops returns without starting anything.
    pub(crate) async fn launch(&self, session: Arc<Session>) -> Result<(), ExecutorError> {
        let config = session.config();
        match self.start_process(&session, &config).await {
            Ok(Some(pid)) => {
                if let Err(e) = self.inner.pid_files.write(&config.cmd.path, pid) {
                    warn!(session = %session.id(), "unable to write pid file: {}", e);
                }
                session.encode(&*self.inner.sink)?;
                info!(session = %session.id(), pid, "Launched command {}", config.cmd.path);
                Ok(())
            }
            Ok(None) => {
                info!(session = %session.id(), "executor stopped before session was cleared to launch");
                Ok(())
            }
            Err(detail) => {
                session.state().started = detail.clone();
                session.encode(&*self.inner.sink)?;
                Err(ExecutorError::Launch {
                    id: session.id().to_string(),
                    detail,
                })
            }
        }
    }

    async fn start_process(
        &self,
        session: &Arc<Session>,
        config: &SessionConfig,
    ) -> Result<Option<i32>, String> {
        let env = self.inner.platform.process_env(config.cmd.env.clone());
        let path = lookpath(&config.cmd.path, &env, &config.cmd.dir).map_err(|e| e.to_string())?;
        let credential =
            user::resolve(&self.inner.options.root, &config.user, &config.group).map_err(|e| e.to_string())?;
        let io = session
            .io()
            .ok_or_else(|| format!("stdio for session {} is not initialized", session.id()))?;

        let mut cmd = Command::new(&path);
        if let Some((arg0, rest)) = config.cmd.args.split_first() {
            cmd.arg0(arg0).args(rest);
        }
        cmd.env_clear();
        for var in &env {
            if let Some((k, v)) = var.split_once('=') {
                cmd.env(k, v);
            }
        }
        if !config.cmd.dir.is_empty() {
            cmd.current_dir(&config.cmd.dir);
        }
        prepare_child(&mut cmd, config.tty, credential);

        let gate = session.state().clear_to_launch.clone();
        if let Some(gate) = gate {
            debug!(session = %session.id(), "waiting for clear to launch");
            tokio::select! {
                _ = gate.cancelled() => {}
                _ = self.inner.cancel.cancelled() => return Ok(None),
            }
        }

        let master = if config.tty {
            let pair = pty::openpty().map_err(|e| format!("unable to allocate pty: {}", e))?;
            let slave = || {
                pair.slave
                    .try_clone()
                    .map(Stdio::from)
                    .map_err(|e| e.to_string())
            };
            cmd.stdin(slave()?).stdout(slave()?).stderr(slave()?);
            Some(pair.master)
        } else {
            cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
            None
        };

        let (pid, wiring) = {
            let _guard = spawn_guard();
            let mut pids = self
                .inner
                .pids
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut child = cmd.spawn().map_err(|e| e.to_string())?;
            let pid = child.id() as i32;
            pids.insert(
                pid,
                SessionRef {
                    kind: session.kind(),
                    id: session.id().to_string(),
                },
            );

            let wiring = match master {
                Some(master) => Wiring::Pty(Arc::new(master)),
                None => Wiring::Pipes {
                    stdin: child.stdin.take(),
                    stdout: child.stdout.take(),
                    stderr: child.stderr.take(),
                },
            };
            (pid, wiring)
        };
        // Drops our copies of the pty slave.
        drop(cmd);

        let copiers = match &wiring {
            Wiring::Pipes { .. } => 2,
            Wiring::Pty(_) => 1,
        };
        let (drain_tx, drain_rx) = watch::channel(copiers);
        let drain_tx = Arc::new(drain_tx);

        {
            let mut st = session.state();
            st.pid = Some(pid);
            st.launched = true;
            st.started = "true".to_string();
            st.drain = Some(drain_rx);
            if let Wiring::Pty(master) = &wiring {
                st.pty = Some(master.clone());
            }
        }

        if let Err(e) = wire(session.id(), wiring, &io, drain_tx) {
            discard(session, pid);
            return Err(format!("unable to wire stdio: {}", e));
        }
        Ok(Some(pid))
    }
}

/// Kill a process whose stdio could not be wired. Its pid stays registered,
/// so the exit is still reaped and recorded.
fn discard(session: &Session, pid: i32) {
    {
        let mut st = session.state();
        st.drain = None;
        st.pty = None;
    }
    warn!(session = %session.id(), pid, "killing process with unwired stdio");
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
        warn!(session = %session.id(), pid, "unable to kill process: {}", e);
    }
}

fn prepare_child(cmd: &mut Command, tty: bool, credential: Option<Credential>) {
    let groups: Vec<libc::gid_t> = credential
        .as_ref()
        .map(|c| c.groups.iter().map(|g| *g as libc::gid_t).collect())
        .unwrap_or_default();

    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            if tty && libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            if let Some(c) = &credential {
                if libc::setgroups(groups.len() as _, groups.as_ptr()) < 0
                    || libc::setgid(c.gid) < 0
                    || libc::setuid(c.uid) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

fn wire(
    id: &str,
    wiring: Wiring,
    io: &SessionIo,
    drain: Arc<watch::Sender<usize>>,
) -> io::Result<()> {
    match wiring {
        Wiring::Pipes {
            stdin,
            stdout,
            stderr,
        } => {
            if let Some(out) = stdout {
                copy_out(id, "stdout", out, io.stdout.clone(), drain.clone())?;
            }
            if let Some(err) = stderr {
                copy_out(id, "stderr", err, io.stderr.clone(), drain.clone())?;
            }
            if let Some(input) = stdin {
                copy_in(id, io.stdin.clone(), input)?;
            }
        }
        Wiring::Pty(master) => {
            let reader = master.try_clone()?;
            let writer = master.try_clone()?;
            copy_out(id, "pty", reader, io.stdout.clone(), drain)?;
            copy_in(id, io.stdin.clone(), writer)?;
        }
    }
    Ok(())
}

/// Copy process output into a fan-out until end-of-file, then count down the
/// drain barrier.
fn copy_out<R: Read + Send + 'static>(
    id: &str,
    what: &'static str,
    mut from: R,
    to: Arc<MultiWriter>,
    drain: Arc<watch::Sender<usize>>,
) -> io::Result<()> {
    let id = id.to_string();
    thread::Builder::new()
        .name(format!("{}-{}", id, what))
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                let n = match from.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    // A pty master reports EIO once the slave side is gone.
                    Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                    Err(e) => {
                        warn!(session = %id, "{} copy failed: {}", what, e);
                        break;
                    }
                };
                // Keep draining the process even when no endpoint accepts it.
                if let Err(e) = (&*to).write_all(&buf[..n]) {
                    debug!(session = %id, "{} fan-out error: {}", what, e);
                }
            }
            debug!(session = %id, "{} copy finished", what);
            drain.send_modify(|remaining| *remaining = remaining.saturating_sub(1));
        })?;
    Ok(())
}

/// Copy merged client input to the process until the reader is closed.
fn copy_in<W: Write + Send + 'static>(id: &str, from: Arc<MultiReader>, mut to: W) -> io::Result<()> {
    let id = id.to_string();
    thread::Builder::new()
        .name(format!("{}-stdin", id))
        .spawn(move || {
            let mut reader: &MultiReader = &from;
            match io::copy(&mut reader, &mut to) {
                Ok(n) => debug!(session = %id, "stdin copy finished after {} bytes", n),
                Err(e) => debug!(session = %id, "stdin copy ended: {}", e),
            }
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;
    use crate::config::SessionKind;
    use crate::source::MapStore;

    fn session() -> Session {
        let store = MapStore::new();
        store.insert("sessions/s1/cmd/path", "/bin/sleep");
        let mut config = SessionConfig::decode(&store, "sessions/s1/").unwrap();
        config.id = "s1".into();
        Session::new(SessionKind::Session, config)
    }

    #[test]
    fn test_unwired_process_is_killed() {
        let s = session();
        let mut child = Command::new("/bin/sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        let (_drain_tx, drain_rx) = watch::channel(2usize);
        {
            let mut st = s.state();
            st.pid = Some(pid);
            st.drain = Some(drain_rx);
            st.pty = Some(Arc::new(pty::openpty().unwrap().master));
        }

        discard(&s, pid);

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        let st = s.state();
        assert!(st.drain.is_none());
        assert!(st.pty.is_none());
        // exit bookkeeping is left to the reaper
        assert_eq!(st.pid, Some(pid));
    }
}
