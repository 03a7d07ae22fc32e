use std::ffi::OsString;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::socket::{setsockopt, sockopt};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::packet::{self, ClientId, Reply, Request};
use crate::{IpNet, NetError};

const CLIENT_PORT: u16 = 68;
const SERVER_PORT: u16 = 67;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Used when a server omits the lease time option.
const FALLBACK_LEASE: Duration = Duration::from_secs(3600);

/// A bound lease: the acknowledgement plus who it was granted to.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub client: ClientId,
    pub ack: Reply,
}

impl Lease {
    pub fn assigned(&self) -> IpNet {
        self.ack.assigned()
    }

    pub fn gateway(&self) -> IpNet {
        self.ack.gateway()
    }

    pub fn nameservers(&self) -> Vec<IpAddr> {
        self.ack.nameservers()
    }

    pub fn lease_time(&self) -> Duration {
        self.ack.lease_time.unwrap_or(FALLBACK_LEASE)
    }
}

#[async_trait]
pub trait DhcpClient: Send + Sync {
    /// DISCOVER, then REQUEST the first complete offer.
    async fn request(&self, client: &ClientId, params: &[u8]) -> Result<Lease, NetError>;

    /// Extend an existing lease. A NAK is an error.
    async fn renew(&self, lease: &Lease, params: &[u8]) -> Result<Lease, NetError>;

    async fn release(&self, lease: &Lease) -> Result<(), NetError>;
}

/// Run `op` until it succeeds or fails with something other than a
/// transient error.
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, NetError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NetError>>,
{
    loop {
        match op().await {
            Err(e) if e.is_transient() => {
                tracing::debug!("retrying dhcp exchange: {}", e);
                tokio::task::yield_now().await;
            }
            result => return result,
        }
    }
}

/// DHCP over a UDP socket bound to the client interface.
pub struct UdpClient {
    timeout: Duration,
}

impl Default for UdpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpClient {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn bind(&self, client: &ClientId) -> Result<UdpSocket, NetError> {
        let sock = std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, CLIENT_PORT))?;
        sock.set_broadcast(true)?;
        setsockopt(&sock, sockopt::BindToDevice, &OsString::from(&client.ifname))?;
        sock.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(sock)?)
    }

    async fn exchange(
        &self,
        sock: &UdpSocket,
        to: Ipv4Addr,
        request: &Request,
    ) -> Result<Reply, NetError> {
        let dest = SocketAddr::V4(SocketAddrV4::new(to, SERVER_PORT));
        sock.send_to(&request.encode(), dest).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 1500];
        loop {
            let (n, from) = match tokio::time::timeout_at(deadline, sock.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => {
                    return Err(NetError::Dhcp {
                        detail: format!("no reply to xid {:#x}", request.xid),
                        transient: true,
                    });
                }
            };

            let reply = match Reply::parse(&buf[..n]) {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::debug!("ignoring packet from {}: {}", from, e);
                    continue;
                }
            };
            if reply.xid == request.xid && reply.mac == request.client.mac {
                return Ok(reply);
            }
        }
    }

    async fn request_once(&self, client: &ClientId, params: &[u8]) -> Result<Lease, NetError> {
        let sock = self.bind(client)?;
        let xid: u32 = rand::random();

        let discover = Request::discover(xid, client.clone(), params);
        let offer = loop {
            let reply = self.exchange(&sock, Ipv4Addr::BROADCAST, &discover).await?;
            if reply.kind == packet::OFFER && reply.is_complete() {
                break reply;
            }
            tracing::debug!("skipping incomplete offer {:?}", reply);
        };

        let select = Request::select(&offer, client.clone(), params);
        let ack = self.exchange(&sock, Ipv4Addr::BROADCAST, &select).await?;
        match ack.kind {
            packet::ACK => Ok(Lease {
                client: client.clone(),
                ack,
            }),
            packet::NAK => Err(NetError::dhcp("got NAK from DHCP server")),
            other => Err(NetError::dhcp(format!("unexpected message type {}", other))),
        }
    }

    async fn renew_once(&self, lease: &Lease, params: &[u8]) -> Result<Lease, NetError> {
        let sock = self.bind(&lease.client)?;
        let renew = Request::renew(rand::random(), &lease.ack, lease.client.clone(), params);
        let ack = self.exchange(&sock, lease.ack.server(), &renew).await?;
        match ack.kind {
            packet::ACK => Ok(Lease {
                client: lease.client.clone(),
                ack,
            }),
            packet::NAK => Err(NetError::dhcp("received NAK from DHCP server")),
            other => Err(NetError::dhcp(format!("unexpected message type {}", other))),
        }
    }
}

#[async_trait]
impl DhcpClient for UdpClient {
    async fn request(&self, client: &ClientId, params: &[u8]) -> Result<Lease, NetError> {
        tracing::debug!("dhcp request on {}", client.ifname);
        with_retry(|| self.request_once(client, params)).await
    }

    async fn renew(&self, lease: &Lease, params: &[u8]) -> Result<Lease, NetError> {
        tracing::debug!("renewing IP {}", lease.ack.yiaddr);
        with_retry(|| self.renew_once(lease, params)).await
    }

    async fn release(&self, lease: &Lease) -> Result<(), NetError> {
        tracing::debug!("releasing IP {}", lease.ack.yiaddr);
        let dest = SocketAddr::V4(SocketAddrV4::new(lease.ack.server(), SERVER_PORT));
        with_retry(|| async {
            let sock = self.bind(&lease.client)?;
            let release = Request::release(rand::random(), &lease.ack, lease.client.clone());
            sock.send_to(&release.encode(), dest).await?;
            Ok::<(), NetError>(())
        })
        .await
    }
}
