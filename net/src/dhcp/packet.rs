//! DHCP client messages.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::{IpNet, NetError};

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

pub const DISCOVER: u8 = 1;
pub const OFFER: u8 = 2;
pub const REQUEST: u8 = 3;
pub const ACK: u8 = 5;
pub const NAK: u8 = 6;
pub const RELEASE: u8 = 7;

pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS: u8 = 6;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAMETER_LIST: u8 = 55;
pub const OPT_CLIENT_ID: u8 = 61;
const OPT_PAD: u8 = 0;
const OPT_END: u8 = 255;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const OPTIONS_OFFSET: usize = 240;
const MIN_SIZE: usize = 300;

/// Identifies this client to the server: interface plus hardware address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId {
    pub ifname: String,
    pub ifindex: u32,
    pub mac: [u8; 6],
}

impl ClientId {
    /// Option 61 payload: hardware type 1 (ethernet) then the MAC.
    fn encode(&self) -> [u8; 7] {
        let mut b = [1u8; 7];
        b[1..].copy_from_slice(&self.mac);
        b
    }
}

/// An outgoing client message.
#[derive(Debug, Clone)]
pub struct Request {
    pub xid: u32,
    pub kind: u8,
    pub client: ClientId,
    /// Our current address, for RENEW and RELEASE.
    pub ciaddr: Ipv4Addr,
    pub requested: Option<Ipv4Addr>,
    pub server: Option<Ipv4Addr>,
    pub params: Vec<u8>,
}

impl Request {
    pub fn discover(xid: u32, client: ClientId, params: &[u8]) -> Self {
        Self {
            xid,
            kind: DISCOVER,
            client,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            requested: None,
            server: None,
            params: params.to_vec(),
        }
    }

    /// Accept an offer.
    pub fn select(offer: &Reply, client: ClientId, params: &[u8]) -> Self {
        Self {
            xid: offer.xid,
            kind: REQUEST,
            client,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            requested: Some(offer.yiaddr),
            server: offer.server_id,
            params: params.to_vec(),
        }
    }

    /// Extend a bound lease, unicast to the server that granted it.
    pub fn renew(xid: u32, lease: &Reply, client: ClientId, params: &[u8]) -> Self {
        Self {
            xid,
            kind: REQUEST,
            client,
            ciaddr: lease.yiaddr,
            requested: None,
            server: None,
            params: params.to_vec(),
        }
    }

    pub fn release(xid: u32, lease: &Reply, client: ClientId) -> Self {
        Self {
            xid,
            kind: RELEASE,
            client,
            ciaddr: lease.yiaddr,
            requested: None,
            server: lease.server_id,
            params: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dhcp = vec![0u8; OPTIONS_OFFSET];
        dhcp[0] = BOOTREQUEST;
        dhcp[1] = 1; // Ethernet
        dhcp[2] = 6; // MAC length
        dhcp[4..8].copy_from_slice(&self.xid.to_be_bytes());
        if self.ciaddr.is_unspecified() {
            // no address yet, ask for a broadcast reply
            dhcp[10..12].copy_from_slice(&[0x80, 0]);
        }
        dhcp[12..16].copy_from_slice(&self.ciaddr.octets());
        dhcp[28..34].copy_from_slice(&self.client.mac);
        dhcp[236..240].copy_from_slice(&MAGIC_COOKIE);

        push_option(&mut dhcp, OPT_MESSAGE_TYPE, &[self.kind]);
        push_option(&mut dhcp, OPT_CLIENT_ID, &self.client.encode());
        if let Some(ip) = self.requested {
            push_option(&mut dhcp, OPT_REQUESTED_IP, &ip.octets());
        }
        if let Some(server) = self.server {
            push_option(&mut dhcp, OPT_SERVER_ID, &server.octets());
        }
        if !self.params.is_empty() {
            push_option(&mut dhcp, OPT_PARAMETER_LIST, &self.params);
        }
        dhcp.push(OPT_END);

        if dhcp.len() < MIN_SIZE {
            dhcp.resize(MIN_SIZE, OPT_PAD);
        }
        dhcp
    }
}

fn push_option(dhcp: &mut Vec<u8>, code: u8, value: &[u8]) {
    dhcp.push(code);
    dhcp.push(value.len() as u8);
    dhcp.extend_from_slice(value);
}

/// A parsed server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub xid: u32,
    pub kind: u8,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub mac: [u8; 6],
    pub subnet_mask: Option<Ipv4Addr>,
    pub routers: Vec<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub lease_time: Option<Duration>,
    pub server_id: Option<Ipv4Addr>,
}

impl Reply {
    pub fn parse(payload: &[u8]) -> Result<Self, NetError> {
        if payload.len() < OPTIONS_OFFSET {
            return Err(NetError::dhcp(format!("short packet ({} bytes)", payload.len())));
        }
        if payload[0] != BOOTREPLY {
            return Err(NetError::dhcp("not a BOOTREPLY"));
        }
        if payload[236..240] != MAGIC_COOKIE {
            return Err(NetError::dhcp("bad magic cookie"));
        }

        let ipv4 = |at: usize| Ipv4Addr::new(payload[at], payload[at + 1], payload[at + 2], payload[at + 3]);
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&payload[28..34]);

        let mut reply = Reply {
            xid: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
            kind: 0,
            yiaddr: ipv4(16),
            siaddr: ipv4(20),
            mac,
            subnet_mask: None,
            routers: Vec::new(),
            dns: Vec::new(),
            lease_time: None,
            server_id: None,
        };

        for (code, value) in options(&payload[OPTIONS_OFFSET..]) {
            match code {
                OPT_MESSAGE_TYPE if !value.is_empty() => reply.kind = value[0],
                OPT_SUBNET_MASK => reply.subnet_mask = addrs(value).into_iter().next(),
                OPT_ROUTER => reply.routers = addrs(value),
                OPT_DNS => reply.dns = addrs(value),
                OPT_SERVER_ID => reply.server_id = addrs(value).into_iter().next(),
                OPT_LEASE_TIME if value.len() == 4 => {
                    let secs = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                    reply.lease_time = Some(Duration::from_secs(u64::from(secs)));
                }
                _ => {}
            }
        }

        if reply.kind == 0 {
            return Err(NetError::dhcp("reply carries no message type"));
        }
        Ok(reply)
    }

    /// An offer or ack we can actually configure an interface from.
    pub fn is_complete(&self) -> bool {
        !self.yiaddr.is_unspecified()
            && self.subnet_mask.is_some_and(|m| u32::from(m) != 0)
            && self.lease_time.is_some_and(|t| !t.is_zero())
    }

    pub fn assigned(&self) -> IpNet {
        IpNet::from_mask(self.yiaddr, self.subnet_mask.unwrap_or(Ipv4Addr::BROADCAST))
    }

    pub fn gateway(&self) -> IpNet {
        match self.routers.first() {
            Some(gw) => IpNet::from_mask(*gw, self.subnet_mask.unwrap_or(Ipv4Addr::BROADCAST)),
            None => IpNet::unspecified(),
        }
    }

    pub fn nameservers(&self) -> Vec<IpAddr> {
        self.dns.iter().copied().map(IpAddr::V4).collect()
    }

    /// Where to send renewals and releases.
    pub fn server(&self) -> Ipv4Addr {
        match self.server_id {
            Some(id) if !id.is_unspecified() => id,
            _ => self.siaddr,
        }
    }
}

/// Iterate `(code, value)` pairs of an options block, stopping at END.
fn options(mut block: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    std::iter::from_fn(move || {
        loop {
            let (&code, rest) = block.split_first()?;
            match code {
                OPT_END => return None,
                OPT_PAD => block = rest,
                _ => {
                    let (&len, rest) = rest.split_first()?;
                    let len = len as usize;
                    if rest.len() < len {
                        return None;
                    }
                    let (value, rest) = rest.split_at(len);
                    block = rest;
                    return Some((code, value));
                }
            }
        }
    })
}

fn addrs(value: &[u8]) -> Vec<Ipv4Addr> {
    value
        .chunks_exact(4)
        .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a server reply the way a minimal DHCP server would.
    pub(crate) fn build_reply(
        xid: u32,
        kind: u8,
        yiaddr: Ipv4Addr,
        server: Ipv4Addr,
        lease_secs: u32,
    ) -> Vec<u8> {
        let mut dhcp = vec![0u8; OPTIONS_OFFSET];
        dhcp[0] = BOOTREPLY;
        dhcp[1] = 1;
        dhcp[2] = 6;
        dhcp[4..8].copy_from_slice(&xid.to_be_bytes());
        dhcp[16..20].copy_from_slice(&yiaddr.octets());
        dhcp[20..24].copy_from_slice(&server.octets());
        dhcp[236..240].copy_from_slice(&MAGIC_COOKIE);

        push_option(&mut dhcp, OPT_MESSAGE_TYPE, &[kind]);
        push_option(&mut dhcp, OPT_SERVER_ID, &server.octets());
        push_option(&mut dhcp, OPT_LEASE_TIME, &lease_secs.to_be_bytes());
        push_option(&mut dhcp, OPT_SUBNET_MASK, &[255, 255, 255, 0]);
        push_option(&mut dhcp, OPT_ROUTER, &server.octets());
        push_option(&mut dhcp, OPT_DNS, &[8, 8, 8, 8, 1, 1, 1, 1]);
        dhcp.push(OPT_END);
        dhcp
    }

    fn client() -> ClientId {
        ClientId {
            ifname: "eth0".into(),
            ifindex: 2,
            mac: [0x00, 0x50, 0x56, 0x01, 0x02, 0x03],
        }
    }

    #[test]
    fn test_discover_layout() {
        let p = Request::discover(0xdeadbeef, client(), &[OPT_SUBNET_MASK, OPT_ROUTER]).encode();
        assert_eq!(p.len(), MIN_SIZE);
        assert_eq!(p[0], BOOTREQUEST);
        assert_eq!(&p[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&p[10..12], &[0x80, 0]);
        assert_eq!(&p[28..34], &client().mac);
        assert_eq!(&p[236..240], &MAGIC_COOKIE);

        let opts: Vec<(u8, Vec<u8>)> = options(&p[OPTIONS_OFFSET..])
            .map(|(c, v)| (c, v.to_vec()))
            .collect();
        assert_eq!(opts[0], (OPT_MESSAGE_TYPE, vec![DISCOVER]));
        assert_eq!(opts[1].0, OPT_CLIENT_ID);
        assert_eq!(opts[2], (OPT_PARAMETER_LIST, vec![OPT_SUBNET_MASK, OPT_ROUTER]));
    }

    #[test]
    fn test_parse_ack() {
        let raw = build_reply(7, ACK, Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(10, 0, 0, 1), 600);
        let r = Reply::parse(&raw).unwrap();
        assert_eq!(r.kind, ACK);
        assert_eq!(r.xid, 7);
        assert!(r.is_complete());
        assert_eq!(r.assigned().to_string(), "10.0.0.9/24");
        assert_eq!(r.gateway().to_string(), "10.0.0.1/24");
        assert_eq!(r.lease_time, Some(Duration::from_secs(600)));
        assert_eq!(r.nameservers().len(), 2);
        assert_eq!(r.server(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_renew_carries_ciaddr_and_unicasts() {
        let raw = build_reply(7, ACK, Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(10, 0, 0, 1), 600);
        let lease = Reply::parse(&raw).unwrap();
        let p = Request::renew(8, &lease, client(), &[OPT_SUBNET_MASK]).encode();
        assert_eq!(&p[12..16], &[10, 0, 0, 9]);
        assert_eq!(&p[10..12], &[0, 0]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Reply::parse(&[0u8; 10]).is_err());
        let mut raw = build_reply(1, ACK, Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(10, 0, 0, 1), 60);
        raw[236] = 0;
        assert!(Reply::parse(&raw).is_err());
    }

    #[test]
    fn test_truncated_option_stops_parsing() {
        let mut block = vec![OPT_PAD, OPT_MESSAGE_TYPE, 1, ACK, OPT_DNS, 8, 1, 2];
        let parsed: Vec<u8> = options(&block).map(|(c, _)| c).collect();
        assert_eq!(parsed, vec![OPT_MESSAGE_TYPE]);
        block.clear();
        assert_eq!(options(&block).count(), 0);
    }
}
