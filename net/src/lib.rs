//! Guest network configuration.
//!
//! Endpoints name a virtual NIC by PCI slot. The [`NetworkEngine`] finds the
//! kernel link behind the slot, renames it, installs a static or DHCP-leased
//! address plus routes, keeps `/etc/hosts` and `/etc/resolv.conf` in step,
//! and keeps leases renewed until it is stopped.

pub mod dhcp;
mod endpoint;
mod engine;
mod error;
pub mod etcconf;
mod ipnet;
pub mod netlink;
pub mod pci;

pub use endpoint::{DhcpInfo, Network, NetworkEndpoint, SharedEndpoint};
pub use engine::{EndpointSink, NetworkEngine};
pub use error::NetError;
pub use ipnet::IpNet;
pub use netlink::{IpCommand, Link, Netlink, Route, SpawnLock};
