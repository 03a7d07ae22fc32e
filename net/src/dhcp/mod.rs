//! DHCP lease acquisition and upkeep.

mod client;
pub mod packet;

pub use client::{with_retry, DhcpClient, Lease, UdpClient};
pub use packet::{ClientId, Reply};
