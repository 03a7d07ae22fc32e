use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::NetError;

/// An interface address with its prefix length, e.g. `10.0.0.2/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, NetError> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(NetError::Address(format!("{}/{}", addr, prefix)));
        }
        Ok(Self { addr, prefix })
    }

    /// Build from an address and a dotted v4 netmask.
    pub fn from_mask(addr: Ipv4Addr, mask: Ipv4Addr) -> Self {
        Self {
            addr: IpAddr::V4(addr),
            prefix: u32::from(mask).leading_ones() as u8,
        }
    }

    /// The all-zero v4 network, used as "unset".
    pub const fn unspecified() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix: 0,
        }
    }

    /// `0.0.0.0/0`, the destination of a default route.
    pub const fn default_route() -> Self {
        Self::unspecified()
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_unspecified(&self) -> bool {
        self.addr.is_unspecified()
    }

    pub fn netmask_v4(&self) -> Option<Ipv4Addr> {
        match self.addr {
            IpAddr::V4(_) => Some(Ipv4Addr::from(prefix_mask(self.prefix))),
            IpAddr::V6(_) => None,
        }
    }

    /// The network address with host bits cleared.
    pub fn network(&self) -> Self {
        match self.addr {
            IpAddr::V4(a) => Self {
                addr: IpAddr::V4(Ipv4Addr::from(u32::from(a) & prefix_mask(self.prefix))),
                prefix: self.prefix,
            },
            IpAddr::V6(_) => *self,
        }
    }
}

fn prefix_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p.min(32))),
    }
}

impl Default for IpNet {
    fn default() -> Self {
        Self::unspecified()
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for IpNet {
    type Err = NetError;

    /// Accepts CIDR text, or a bare address which gets a host prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = || NetError::Address(s.to_string());
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| bad())?;
                let prefix: u8 = prefix.parse().map_err(|_| bad())?;
                IpNet::new(addr, prefix).map_err(|_| bad())
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| bad())?;
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                Ok(Self { addr, prefix })
            }
        }
    }
}

impl From<IpAddr> for IpNet {
    fn from(addr: IpAddr) -> Self {
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, prefix }
    }
}

impl Serialize for IpNet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpNet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let net: IpNet = "127.0.0.2/24".parse().unwrap();
        assert_eq!(net.addr(), IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)));
        assert_eq!(net.prefix(), 24);
        assert_eq!(net.to_string(), "127.0.0.2/24");
        assert_eq!(net.netmask_v4(), Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(net.network().to_string(), "127.0.0.0/24");
    }

    #[test]
    fn test_bare_address_gets_host_prefix() {
        let net: IpNet = "10.1.2.3".parse().unwrap();
        assert_eq!(net.prefix(), 32);
        let v6: IpNet = "::1".parse().unwrap();
        assert_eq!(v6.prefix(), 128);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("10.0.0.1/33".parse::<IpNet>().is_err());
        assert!("nonsense".parse::<IpNet>().is_err());
        assert!("10.0.0.1/x".parse::<IpNet>().is_err());
    }

    #[test]
    fn test_from_mask() {
        let net = IpNet::from_mask(Ipv4Addr::new(192, 168, 1, 9), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(net.to_string(), "192.168.1.9/16");
        assert!(IpNet::unspecified().is_unspecified());
    }

    #[test]
    fn test_serde_as_text() {
        let net: IpNet = "172.16.0.1/12".parse().unwrap();
        let json = serde_json::to_string(&vec![net]).unwrap();
        assert_eq!(json, r#"["172.16.0.1/12"]"#);
        let back: Vec<IpNet> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![net]);
    }
}
