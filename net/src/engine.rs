use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use nix::errno::Errno;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dhcp::packet::{OPT_DNS, OPT_ROUTER, OPT_SUBNET_MASK};
use crate::dhcp::{ClientId, DhcpClient, Lease};
use crate::etcconf::{Hosts, ResolvConf};
use crate::{DhcpInfo, IpNet, Link, NetError, Netlink, NetworkEndpoint, Route, SharedEndpoint};

/// Secondary routing table kept in step with the default route.
const BRIDGE_OUT_TABLE: u32 = 201;

/// Receives endpoints whose state changed outside a reload.
pub trait EndpointSink: Send + Sync {
    fn endpoint_updated(&self, endpoint: &NetworkEndpoint);
}

struct RenewalLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct State {
    hosts: Hosts,
    resolv: ResolvConf,
    /// Dynamic endpoints riding each slot.
    shared: HashMap<u32, Vec<SharedEndpoint>>,
    leases: HashMap<u32, Lease>,
    /// Nameservers each endpoint put into resolv.conf, by endpoint key.
    installed: HashMap<String, Vec<IpAddr>>,
    loops: HashMap<u32, RenewalLoop>,
}

struct Inner {
    root: PathBuf,
    netlink: Arc<dyn Netlink>,
    dhcp: Arc<dyn DhcpClient>,
    state: Mutex<State>,
    sink: RwLock<Option<Arc<dyn EndpointSink>>>,
}

/// Applies endpoint configuration to the guest and keeps leases alive.
#[derive(Clone)]
pub struct NetworkEngine {
    inner: Arc<Inner>,
}

impl NetworkEngine {
    pub fn new(netlink: Arc<dyn Netlink>, dhcp: Arc<dyn DhcpClient>, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            inner: Arc::new(Inner {
                netlink,
                dhcp,
                state: Mutex::new(State {
                    hosts: Hosts::new(&root),
                    resolv: ResolvConf::new(&root),
                    shared: HashMap::new(),
                    leases: HashMap::new(),
                    installed: HashMap::new(),
                    loops: HashMap::new(),
                }),
                sink: RwLock::new(None),
                root,
            }),
        }
    }

    pub fn netlink(&self) -> &Arc<dyn Netlink> {
        &self.inner.netlink
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn set_sink(&self, sink: Arc<dyn EndpointSink>) {
        if let Ok(mut guard) = self.inner.sink.write() {
            *guard = Some(sink);
        }
    }

    /// Seed the hosts file with the standard local entries and start from an
    /// empty resolv.conf.
    pub async fn setup(&self) -> Result<(), NetError> {
        let mut st = self.inner.state.lock().await;
        st.hosts.load()?;

        let entries: [(&str, IpAddr); 7] = [
            ("localhost", IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ("ip6-localhost", IpAddr::V6(Ipv6Addr::LOCALHOST)),
            ("ip6-loopback", IpAddr::V6(Ipv6Addr::LOCALHOST)),
            ("ip6-localnet", IpAddr::V6(Ipv6Addr::new(0xfe00, 0, 0, 0, 0, 0, 0, 0))),
            ("ip6-mcastprefix", IpAddr::V6(Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0))),
            ("ip6-allnodes", IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1))),
            ("ip6-allrouters", IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2))),
        ];
        for (name, addr) in entries {
            st.hosts.set_host(name, addr);
        }
        st.hosts.save()?;

        match std::fs::remove_file(st.resolv.path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        st.resolv = ResolvConf::new(&self.inner.root);
        Ok(())
    }

    /// Map names to an address in the hosts file.
    pub async fn set_hosts(&self, names: &[&str], addr: IpAddr) -> Result<(), NetError> {
        let mut st = self.inner.state.lock().await;
        for name in names {
            st.hosts.set_host(name, addr);
        }
        st.hosts.save()
    }

    /// Bring the guest in line with one endpoint. A no-op once `configured`.
    pub async fn apply(&self, shared: &SharedEndpoint) -> Result<(), NetError> {
        let mut ep = shared.lock().await;
        if ep.configured {
            tracing::debug!(endpoint = %ep.key, "already configured");
            return Ok(());
        }
        tracing::info!(endpoint = %ep.key, slot = %ep.id, "applying endpoint configuration");

        let slot = ep.slot().ok_or_else(|| {
            NetError::Config(format!(
                "endpoint ID must be a base10 numeric pci slot identifier: {}",
                ep.id
            ))
        })?;
        let link = self.inner.netlink.link_by_slot(slot)?;
        let link = self.rename_link(link, slot, &ep)?;
        self.inner.netlink.set_up(&link)?;

        let mut fresh = None;
        let new_ip = if ep.is_dynamic() {
            if ep.dhcp.is_none() {
                // another endpoint on this NIC may already hold a lease
                let st = self.inner.state.lock().await;
                if let Some(lease) = st.leases.get(&slot) {
                    ep.dhcp = Some(dhcp_info(lease));
                }
            }
            match &ep.dhcp {
                Some(info) => info.assigned,
                None => {
                    let lease = self.acquire(&link, &ep).await?;
                    let info = dhcp_info(&lease);
                    let ip = info.assigned;
                    ep.dhcp = Some(info);
                    fresh = Some(lease);
                    ip
                }
            }
        } else {
            let ip = ep.ip.ok_or_else(|| {
                NetError::Config(format!(
                    "static ip for network {} is not specified",
                    ep.network.name
                ))
            })?;
            if ip.is_unspecified() {
                tracing::info!(endpoint = %ep.key, "address managed externally");
                ep.configured = true;
                return Ok(());
            }
            ip
        };

        if let Err(e) = self.install(&link, new_ip, &mut ep).await {
            if let Some(lease) = fresh {
                let _ = self.inner.dhcp.release(&lease).await;
            }
            return Err(e);
        }

        if ep.is_dynamic() {
            let mut st = self.inner.state.lock().await;
            let riders = st.shared.entry(slot).or_default();
            if !riders.iter().any(|e| Arc::ptr_eq(e, shared)) {
                riders.push(shared.clone());
            }
            if let Some(lease) = fresh {
                st.leases.insert(slot, lease.clone());
                if !st.loops.contains_key(&slot) {
                    let cancel = CancellationToken::new();
                    let task = tokio::spawn(renewal_loop(
                        self.clone(),
                        slot,
                        lease,
                        request_params(&ep),
                        cancel.clone(),
                    ));
                    st.loops.insert(slot, RenewalLoop { cancel, task });
                }
            }
        }

        ep.configured = true;
        Ok(())
    }

    /// Stop every renewal loop. Each releases its lease before exiting.
    pub async fn stop(&self) {
        let loops: Vec<RenewalLoop> = {
            let mut st = self.inner.state.lock().await;
            st.loops.drain().map(|(_, l)| l).collect()
        };
        for l in &loops {
            l.cancel.cancel();
        }
        for l in loops {
            if let Err(e) = l.task.await {
                tracing::warn!("renewal loop ended abnormally: {}", e);
            }
        }
    }

    fn rename_link(&self, link: Link, slot: u32, ep: &NetworkEndpoint) -> Result<Link, NetError> {
        let nl = &self.inner.netlink;
        if ep.name.is_empty() || link.name == ep.name || link.alias == ep.name {
            return Ok(link);
        }

        if link.name.starts_with("eth") {
            tracing::info!("Renaming link {} to {}", link.name, ep.name);
            nl.set_down(&link)?;
            nl.set_name(&link, &ep.name)?;
            return nl.link_by_slot(slot);
        }

        if link.alias.is_empty() {
            tracing::info!("Aliasing link {} to {}", link.name, ep.name);
            nl.set_alias(&link, &ep.name)?;
            return nl.link_by_slot(slot);
        }

        tracing::warn!(
            "Unable to add additional alias on link {} for {}",
            link.name,
            ep.name
        );
        Ok(link)
    }

    async fn acquire(&self, link: &Link, ep: &NetworkEndpoint) -> Result<Lease, NetError> {
        let mac = link.mac.ok_or_else(|| {
            NetError::Config(format!("link {} has no hardware address", link.name))
        })?;
        let client = ClientId {
            ifname: link.name.clone(),
            ifindex: link.index,
            mac,
        };

        let lease = self.inner.dhcp.request(&client, &request_params(ep)).await?;
        if !lease.ack.is_complete() {
            let _ = self.inner.dhcp.release(&lease).await;
            return Err(NetError::dhcp("dhcp assigned nil ip or subnet mask"));
        }
        tracing::info!(
            "DHCP response: IP={}, Gateway={}, DNS={:?}, Lease Time={:?}",
            lease.assigned(),
            lease.gateway(),
            lease.nameservers(),
            lease.lease_time()
        );
        Ok(lease)
    }

    /// Address, routes, hosts and nameservers for an endpoint whose address
    /// is now known.
    async fn install(&self, link: &Link, new_ip: IpNet, ep: &mut NetworkEndpoint) -> Result<(), NetError> {
        let old = (!ep.assigned.is_unspecified()).then_some(ep.assigned);
        self.update_address(link, old, new_ip)?;
        update_endpoint(new_ip, ep);
        self.update_routes(link, ep)?;

        let mut st = self.inner.state.lock().await;
        if !ep.network.name.is_empty() {
            st.hosts
                .set_host(&format!("{}.localhost", ep.network.name), ep.assigned.addr());
            st.hosts.save()?;
        }

        if let Some(previous) = st.installed.remove(&ep.key) {
            st.resolv.remove_nameservers(&previous);
        }
        let gateway = ep.network.assigned_gateway;
        let current = if !ep.network.assigned_nameservers.is_empty() {
            ep.network.assigned_nameservers.clone()
        } else if !gateway.is_unspecified() {
            vec![gateway.addr()]
        } else {
            Vec::new()
        };
        st.resolv.add_nameservers(&current);
        tracing::info!("Added nameservers: {:?}", current);
        st.installed.insert(ep.key.clone(), current);
        st.resolv.save()
    }

    fn update_address(&self, link: &Link, old: Option<IpNet>, new: IpNet) -> Result<(), NetError> {
        let nl = &self.inner.netlink;
        tracing::info!("setting ip address {} for link {}", new, link.name);

        if let Some(old) = old.filter(|o| o.addr() != new.addr()) {
            tracing::debug!("removing old address {}", old);
            ignore_errno(nl.addr_del(link, &old), Errno::EADDRNOTAVAIL)?;
        }

        match nl.addr_add(link, &new) {
            Err(e) if e.errno() == Some(Errno::EEXIST) => {
                tracing::warn!("address {} already set on interface {}", new, link.name);
                Ok(())
            }
            other => other,
        }
    }

    fn update_routes(&self, link: &Link, ep: &NetworkEndpoint) -> Result<(), NetError> {
        let nl = &self.inner.netlink;
        let gateway = ep.network.assigned_gateway;

        if !ep.network.default {
            let via = (!gateway.is_unspecified()).then_some(gateway.addr());
            for dst in &ep.network.destinations {
                let route = Route {
                    link: link.name.clone(),
                    dst: *dst,
                    gateway: via,
                    table: None,
                };
                ignore_errno(nl.route_add(&route), Errno::EEXIST)?;
            }
            return Ok(());
        }

        if gateway.is_unspecified() {
            tracing::debug!("not setting default route for {}: no gateway", ep.network.name);
            return Ok(());
        }

        let mut tables = vec![None];
        if nl.has_table(BRIDGE_OUT_TABLE) {
            tables.push(Some(BRIDGE_OUT_TABLE));
        }
        for table in tables {
            let mut route = Route {
                link: link.name.clone(),
                dst: IpNet::default_route(),
                gateway: None,
                table,
            };
            ignore_errno(nl.route_del(&route), Errno::ESRCH)?;

            route.gateway = Some(gateway.addr());
            nl.route_add(&route).map_err(|e| {
                NetError::Config(format!(
                    "failed to add gateway route for endpoint {}: {}",
                    ep.network.name, e
                ))
            })?;
        }

        tracing::info!(
            "updated default route to {} interface, gateway: {}",
            ep.network.name,
            gateway.addr()
        );
        Ok(())
    }

    /// Spread a renewed lease over every endpoint on the slot.
    fn renewed<'a>(
        &'a self,
        slot: u32,
        lease: &'a Lease,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let riders = {
            let mut st = self.inner.state.lock().await;
            st.leases.insert(slot, lease.clone());
            st.shared.get(&slot).cloned().unwrap_or_default()
        };

        let info = dhcp_info(lease);
        let sink = self.inner.sink.read().ok().and_then(|s| s.clone());
        for shared in riders {
            {
                let mut ep = shared.lock().await;
                ep.dhcp = Some(info.clone());
                ep.configured = false;
            }
            if let Err(e) = self.apply(&shared).await {
                tracing::error!("failed to apply renewed lease for slot {}: {}", slot, e);
            }
            if let Some(sink) = &sink {
                sink.endpoint_updated(&*shared.lock().await);
            }
        }
        })
    }
}

fn ignore_errno(result: Result<(), NetError>, benign: Errno) -> Result<(), NetError> {
    match result {
        Err(e) if e.errno() == Some(benign) => Ok(()),
        other => other,
    }
}

fn dhcp_info(lease: &Lease) -> DhcpInfo {
    DhcpInfo {
        assigned: lease.assigned(),
        gateway: lease.gateway(),
        nameservers: lease.nameservers(),
        lease_time: lease.lease_time(),
    }
}

/// Subnet mask always; router and DNS only when not configured statically.
fn request_params(ep: &NetworkEndpoint) -> Vec<u8> {
    let mut params = vec![OPT_SUBNET_MASK];
    if ep.network.gateway.is_unspecified() {
        params.push(OPT_ROUTER);
    }
    if ep.network.nameservers.is_empty() {
        params.push(OPT_DNS);
    }
    params
}

fn update_endpoint(new_ip: IpNet, ep: &mut NetworkEndpoint) {
    let net = &mut ep.network;
    match &ep.dhcp {
        None => {
            ep.assigned = new_ip;
            net.assigned_gateway = net.gateway;
            net.assigned_nameservers = net.nameservers.clone();
        }
        Some(dhcp) => {
            ep.assigned = dhcp.assigned;
            net.assigned_gateway = if net.gateway.is_unspecified() {
                dhcp.gateway
            } else {
                net.gateway
            };
            net.assigned_nameservers = if net.nameservers.is_empty() {
                dhcp.nameservers.clone()
            } else {
                net.nameservers.clone()
            };
        }
    }
}

enum LeaseState {
    Bound { lease: Lease, renew_at: Instant },
    Renewing { lease: Lease },
}

/// Floor for renewal and retry waits, so a zero lease time cannot spin.
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);

impl LeaseState {
    fn bound(lease: Lease) -> Self {
        let renew_at = Instant::now() + (lease.lease_time() / 2).max(MIN_RENEW_INTERVAL);
        LeaseState::Bound { lease, renew_at }
    }
}

/// How long to wait before trying again after a failed renewal.
fn retry_delay(lease: &Lease) -> Duration {
    (lease.lease_time() / 8).max(MIN_RENEW_INTERVAL)
}

async fn renewal_loop(
    engine: NetworkEngine,
    slot: u32,
    lease: Lease,
    params: Vec<u8>,
    cancel: CancellationToken,
) {
    let mut state = LeaseState::bound(lease);
    loop {
        state = match state {
            LeaseState::Bound { lease, renew_at } => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        release(&engine, slot, &lease).await;
                        return;
                    }
                    _ = tokio::time::sleep_until(renew_at) => LeaseState::Renewing { lease },
                }
            }
            LeaseState::Renewing { lease } => {
                tracing::info!("renewing IP address {} on slot {}", lease.assigned(), slot);
                let renewed = tokio::select! {
                    _ = cancel.cancelled() => {
                        release(&engine, slot, &lease).await;
                        return;
                    }
                    r = engine.inner.dhcp.renew(&lease, &params) => r,
                };
                match renewed {
                    Ok(new) => {
                        tracing::info!(
                            "successfully renewed ip address: IP={}, Lease Time={:?}",
                            new.assigned(),
                            new.lease_time()
                        );
                        engine.renewed(slot, &new).await;
                        LeaseState::bound(new)
                    }
                    Err(e) => {
                        tracing::error!("failed to renew ip address on slot {}: {}", slot, e);
                        let renew_at = Instant::now() + retry_delay(&lease);
                        LeaseState::Bound { lease, renew_at }
                    }
                }
            }
        };
    }
}

async fn release(engine: &NetworkEngine, slot: u32, lease: &Lease) {
    tracing::info!("releasing IP address {} on slot {}", lease.assigned(), slot);
    if let Err(e) = engine.inner.dhcp.release(lease).await {
        tracing::warn!("failed to release lease on slot {}: {}", slot, e);
    }
}
