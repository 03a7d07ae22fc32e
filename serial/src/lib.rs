//! Backchannel establishment over a raw serial link.
//!
//! A serial port has no framing of its own and may hold stale bytes from a
//! previous session. The handshake in [`handshake`] synchronizes both ends on
//! a fresh pair of random sequence tokens before the attach protocol starts.

mod error;
pub mod handshake;
mod port;

pub use error::SerialError;
pub use handshake::{Handshaker, ACK, DEBUG_ACK, NAK, PROBE, SYN};
pub use port::SerialPort;
