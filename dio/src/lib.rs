//! Dynamic fan-out and fan-in for session stdio.
//!
//! A session's output is written once and delivered to the session log plus
//! every attached client; its input is funnelled from whichever clients are
//! attached. Endpoints come and go while bytes are flowing, so both sides
//! support add/remove concurrently with I/O.

mod reader;
mod writer;

pub use reader::{MultiReader, ReaderId};
pub use writer::{MultiWriter, WriterId};

use std::io;

/// Whether an I/O error means the endpoint is simply finished.
///
/// Endpoints report end-of-stream on write as `UnexpectedEof`, which is the
/// closest std equivalent to a writer-side EOF.
pub fn is_eof(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::UnexpectedEof
}
