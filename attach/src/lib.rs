//! Interactive access to session stdio over the serial backchannel.
//!
//! Once the link is synchronized (see `vigil-serial`) both ends speak plain
//! SSH-2.0. The agent is the server: it answers `container-ids` with the
//! configured session ids and accepts `attach` channels whose extra data
//! names a session. Each channel is bound into the session's stdout, stderr
//! and stdin fan-outs for as long as it stays open.

mod auth;
pub mod client;
pub mod connection;
mod error;
pub mod msgs;
mod server;
pub mod transport;
mod wire;

pub use auth::USER;
pub use client::{AttachClient, AttachedSession};
pub use connection::{Channel, ChannelReader, ChannelRequest, ChannelWriter, Connection, Incoming};
pub use error::AttachError;
pub use msgs::OpenFailure;
pub use server::{AttachServer, Backchannel, SerialBackchannel, Stream};
pub use transport::hostkey::HostKey;
