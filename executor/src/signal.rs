use nix::sys::signal::Signal;

use crate::ExecutorError;

/// Signal names as carried by SSH `signal` requests, without the `SIG` prefix.
const SSH_SIGNALS: &[(&str, Signal)] = &[
    ("ABRT", Signal::SIGABRT),
    ("ALRM", Signal::SIGALRM),
    ("FPE", Signal::SIGFPE),
    ("HUP", Signal::SIGHUP),
    ("ILL", Signal::SIGILL),
    ("INT", Signal::SIGINT),
    ("KILL", Signal::SIGKILL),
    ("PIPE", Signal::SIGPIPE),
    ("QUIT", Signal::SIGQUIT),
    ("SEGV", Signal::SIGSEGV),
    ("TERM", Signal::SIGTERM),
    ("USR1", Signal::SIGUSR1),
    ("USR2", Signal::SIGUSR2),
];

/// Map an SSH signal name to a signal.
pub fn ssh_signal(name: &str) -> Result<Signal, ExecutorError> {
    SSH_SIGNALS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, s)| *s)
        .ok_or_else(|| ExecutorError::Platform(format!("unsupported signal: {}", name)))
}

/// Parse a configured stop signal: an SSH name with or without `SIG`, or a
/// number. Empty means TERM.
pub fn stop_signal(spec: &str) -> Result<Signal, ExecutorError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(Signal::SIGTERM);
    }
    if let Ok(n) = spec.parse::<i32>() {
        return Signal::try_from(n).map_err(ExecutorError::from);
    }
    let upper = spec.to_ascii_uppercase();
    ssh_signal(upper.strip_prefix("SIG").unwrap_or(&upper))
}
