use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::IpNet;

/// An endpoint shared between the executor configuration and the engine's
/// renewal loops.
pub type SharedEndpoint = Arc<tokio::sync::Mutex<NetworkEndpoint>>;

/// The subnet an endpoint sits on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Network {
    pub name: String,
    /// Whether this network carries the default route.
    pub default: bool,
    pub gateway: IpNet,
    pub nameservers: Vec<IpAddr>,
    /// Extra destinations routed through the gateway on non-default networks.
    pub destinations: Vec<IpNet>,
    /// Gateway in effect after configuration, static or leased.
    pub assigned_gateway: IpNet,
    pub assigned_nameservers: Vec<IpAddr>,
}

/// What a DHCP server handed out for an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct DhcpInfo {
    pub assigned: IpNet,
    pub gateway: IpNet,
    pub nameservers: Vec<IpAddr>,
    pub lease_time: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkEndpoint {
    /// Configuration key of the endpoint.
    pub key: String,
    /// Decimal PCI slot of the backing NIC.
    pub id: String,
    /// Desired interface name or alias.
    pub name: String,
    pub is_static: bool,
    pub ip: Option<IpNet>,
    pub assigned: IpNet,
    pub network: Network,
    pub dhcp: Option<DhcpInfo>,
    /// Set once applied; cleared to force another pass.
    pub configured: bool,
}

impl NetworkEndpoint {
    pub fn is_dynamic(&self) -> bool {
        !self.is_static && self.ip.is_none()
    }

    pub fn slot(&self) -> Option<u32> {
        self.id.trim().parse().ok()
    }
}
