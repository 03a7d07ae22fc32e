//! Pieces of the `vigil-init` agent that sit outside the executor: the
//! file-backed configuration store, log output control and early network
//! bring-up.

mod error;
pub mod logging;
pub mod loopback;
pub mod store;

pub use error::GuestError;
pub use logging::{DebugSink, Logging};
pub use store::FileStore;
