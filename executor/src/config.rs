//! Executor configuration and its key layout.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use vigil_mount::MountSpec;
use vigil_net::{EndpointSink, IpNet, Network, NetworkEndpoint, SharedEndpoint};

use crate::session::Session;
use crate::source::{DataSink, DataSource, children};
use crate::ExecutorError;

/// Which sub-tree of the key space a session was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Session,
    Exec,
}

impl SessionKind {
    pub fn prefix(self) -> &'static str {
        match self {
            SessionKind::Session => "sessions",
            SessionKind::Exec => "execs",
        }
    }

    pub fn key(self, id: &str) -> String {
        format!("{}/{}", self.prefix(), id)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cmd {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub dir: String,
}

/// The host-supplied description of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub id: String,
    pub name: String,
    pub cmd: Cmd,
    pub tty: bool,
    pub attach: bool,
    pub restart: bool,
    pub run_block: bool,
    pub active: bool,
    pub stop_signal: String,
    pub user: String,
    pub group: String,
}

impl SessionConfig {
    pub fn decode(source: &dyn DataSource, prefix: &str) -> Result<Self, ExecutorError> {
        let r = Reader { source, prefix };
        Ok(Self {
            id: r.string("common/id"),
            name: r.string("common/name"),
            cmd: Cmd {
                path: r.string("cmd/path"),
                args: r.json("cmd/args")?.unwrap_or_default(),
                env: r.json("cmd/env")?.unwrap_or_default(),
                dir: r.string("cmd/dir"),
            },
            tty: r.bool("tty", false)?,
            attach: r.bool("attach", false)?,
            restart: r.bool("restart", false)?,
            run_block: r.bool("run_block", false)?,
            active: r.bool("active", true)?,
            stop_signal: r.string("stop_signal"),
            user: r.string("user"),
            group: r.string("group"),
        })
    }
}

/// Process-wide executor state, decoded in place on every reload.
#[derive(Default)]
pub struct ExecutorConfig {
    pub id: String,
    pub name: String,
    pub debug_level: i32,
    pub sessions: BTreeMap<String, Arc<Session>>,
    pub execs: BTreeMap<String, Arc<Session>>,
    pub networks: BTreeMap<String, SharedEndpoint>,
    pub mounts: BTreeMap<String, MountSpec>,
    /// Host key presented by the attach server.
    pub key: String,
}

impl ExecutorConfig {
    /// Refresh from `source`. Existing sessions and endpoints are updated in
    /// place so handles held elsewhere stay valid; sessions the source no
    /// longer names are dropped once they are not running.
    pub async fn decode(&mut self, source: &dyn DataSource) -> Result<(), ExecutorError> {
        let r = Reader { source, prefix: "" };
        self.id = r.string("common/id");
        self.name = r.string("common/name");
        self.debug_level = r.int("common/diagnostics/debug")?.unwrap_or(0) as i32;
        self.key = r.string("key");

        decode_sessions(&mut self.sessions, source, SessionKind::Session)?;
        decode_sessions(&mut self.execs, source, SessionKind::Exec)?;

        let mut networks = BTreeMap::new();
        for nid in children(source, "networks") {
            let fresh = decode_endpoint(source, &nid)?;
            let shared = match self.networks.remove(&nid) {
                Some(existing) => {
                    refresh(&mut *existing.lock().await, fresh);
                    existing
                }
                None => Arc::new(tokio::sync::Mutex::new(fresh)),
            };
            networks.insert(nid, shared);
        }
        self.networks = networks;

        let mut mounts = BTreeMap::new();
        for mid in children(source, "mounts") {
            let r = Reader {
                source,
                prefix: &format!("mounts/{}/", mid),
            };
            let spec = MountSpec::new(
                &mid,
                &r.string("source"),
                &r.string("path"),
                &r.string("mode"),
                &r.string("copy_mode"),
            )?;
            mounts.insert(mid, spec);
        }
        self.mounts = mounts;
        Ok(())
    }

    /// Ids of every session (not exec), as advertised to attach clients.
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Look up a session, falling back to execs.
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(id)
            .or_else(|| self.execs.get(id))
            .cloned()
    }

    pub fn all_sessions(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.sessions.values().chain(self.execs.values())
    }

    /// Write every endpoint's assigned state back.
    pub async fn encode_networks(&self, sink: &dyn DataSink) -> Result<(), ExecutorError> {
        for ep in self.networks.values() {
            encode_endpoint(sink, &*ep.lock().await)?;
        }
        Ok(())
    }

    /// Flattened view for debug dumps.
    pub fn dump(&self, source: &dyn DataSource) -> Vec<(String, String)> {
        source
            .keys("")
            .into_iter()
            .filter(|k| k != "key")
            .filter_map(|k| source.get(&k).map(|v| (k, v)))
            .collect()
    }
}

fn decode_sessions(
    sessions: &mut BTreeMap<String, Arc<Session>>,
    source: &dyn DataSource,
    kind: SessionKind,
) -> Result<(), ExecutorError> {
    let ids = children(source, kind.prefix());
    for sid in &ids {
        let prefix = format!("{}/", kind.key(sid));
        let mut config = SessionConfig::decode(source, &prefix)?;
        if config.id.is_empty() {
            config.id = sid.clone();
        }
        match sessions.get(sid) {
            Some(existing) => existing.set_config(config),
            None => {
                let session = Arc::new(Session::new(kind, config));
                session.restore(source, &prefix)?;
                sessions.insert(sid.clone(), session);
            }
        }
    }

    sessions.retain(|sid, session| {
        let keep = ids.contains(sid) || session.is_running();
        if !keep {
            tracing::debug!(session = %sid, "dropping session removed from config");
        }
        keep
    });
    Ok(())
}

fn decode_endpoint(source: &dyn DataSource, nid: &str) -> Result<NetworkEndpoint, ExecutorError> {
    let r = Reader {
        source,
        prefix: &format!("networks/{}/", nid),
    };
    Ok(NetworkEndpoint {
        key: nid.to_string(),
        id: r.string("common/id"),
        name: r.string("common/name"),
        is_static: r.bool("static", false)?,
        ip: r.cidr("ip")?,
        assigned: r.cidr("assigned")?.unwrap_or_default(),
        network: Network {
            name: r.string("network/name"),
            default: r.bool("network/default", false)?,
            gateway: r.cidr("network/gateway")?.unwrap_or_default(),
            nameservers: r.json::<Vec<IpAddr>>("network/nameservers")?.unwrap_or_default(),
            destinations: r.json::<Vec<IpNet>>("network/destinations")?.unwrap_or_default(),
            assigned_gateway: r.cidr("network/assigned/gateway")?.unwrap_or_default(),
            assigned_nameservers: r
                .json::<Vec<IpAddr>>("network/assigned/nameservers")?
                .unwrap_or_default(),
        },
        dhcp: None,
        configured: false,
    })
}

/// Runtime fields survive a refresh; everything else comes from the source.
fn refresh(ep: &mut NetworkEndpoint, fresh: NetworkEndpoint) {
    let assigned = ep.assigned;
    let assigned_gateway = ep.network.assigned_gateway;
    let assigned_nameservers = std::mem::take(&mut ep.network.assigned_nameservers);
    let dhcp = ep.dhcp.take();

    *ep = fresh;
    ep.assigned = assigned;
    ep.network.assigned_gateway = assigned_gateway;
    ep.network.assigned_nameservers = assigned_nameservers;
    ep.dhcp = dhcp;
    ep.configured = false;
}

pub fn encode_endpoint(sink: &dyn DataSink, ep: &NetworkEndpoint) -> Result<(), ExecutorError> {
    let prefix = format!("networks/{}", ep.key);
    sink.set(&format!("{}/assigned", prefix), &ep.assigned.to_string())?;
    sink.set(
        &format!("{}/network/assigned/gateway", prefix),
        &ep.network.assigned_gateway.to_string(),
    )?;
    sink.set(
        &format!("{}/network/assigned/nameservers", prefix),
        &serde_json::to_string(&ep.network.assigned_nameservers)?,
    )?;
    Ok(())
}

/// Writes endpoints renewed in the background back to the sink.
pub struct EndpointWriter {
    sink: Arc<dyn DataSink>,
}

impl EndpointWriter {
    pub fn new(sink: Arc<dyn DataSink>) -> Self {
        Self { sink }
    }
}

impl EndpointSink for EndpointWriter {
    fn endpoint_updated(&self, endpoint: &NetworkEndpoint) {
        let result = encode_endpoint(&*self.sink, endpoint).and_then(|_| self.sink.flush());
        if let Err(e) = result {
            tracing::warn!(endpoint = %endpoint.key, "unable to record renewed lease: {}", e);
        }
    }
}

/// Typed reads under one key prefix.
pub(crate) struct Reader<'a> {
    pub source: &'a dyn DataSource,
    pub prefix: &'a str,
}

impl Reader<'_> {
    fn raw(&self, key: &str) -> Option<String> {
        self.source
            .get(&format!("{}{}", self.prefix, key))
            .filter(|v| !v.is_empty())
    }

    pub fn string(&self, key: &str) -> String {
        self.raw(key).unwrap_or_default()
    }

    pub fn bool(&self, key: &str, default: bool) -> Result<bool, ExecutorError> {
        match self.raw(key).as_deref() {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(ExecutorError::config(format!(
                "{}{}: expected true or false, got {}",
                self.prefix, key, other
            ))),
        }
    }

    pub fn int(&self, key: &str) -> Result<Option<i64>, ExecutorError> {
        self.raw(key)
            .map(|v| {
                v.trim().parse().map_err(|_| {
                    ExecutorError::config(format!("{}{}: not an integer: {}", self.prefix, key, v))
                })
            })
            .transpose()
    }

    pub fn json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ExecutorError> {
        self.raw(key)
            .map(|v| {
                serde_json::from_str(&v).map_err(|e| {
                    ExecutorError::config(format!("{}{}: {}", self.prefix, key, e))
                })
            })
            .transpose()
    }

    pub fn cidr(&self, key: &str) -> Result<Option<IpNet>, ExecutorError> {
        self.raw(key)
            .map(|v| {
                v.parse().map_err(|e| {
                    ExecutorError::config(format!("{}{}: {}", self.prefix, key, e))
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MapStore;

    fn store() -> MapStore {
        let s = MapStore::new();
        s.insert("common/id", "deadbeef");
        s.insert("common/name", "example");
        s.insert("common/diagnostics/debug", "2");
        s.insert("sessions/deadbeef/cmd/path", "/bin/date");
        s.insert("sessions/deadbeef/cmd/args", r#"["date","--reference=/"]"#);
        s.insert("sessions/deadbeef/cmd/env", r#"["PATH=/bin"]"#);
        s.insert("sessions/deadbeef/tty", "false");
        s.insert("execs/helper/cmd/path", "/bin/true");
        s.insert("networks/bridge/common/id", "192");
        s.insert("networks/bridge/common/name", "bridge");
        s.insert("networks/bridge/static", "true");
        s.insert("networks/bridge/ip", "127.0.0.2/24");
        s.insert("networks/bridge/network/default", "true");
        s.insert("networks/bridge/network/gateway", "127.0.0.1/24");
        s.insert("networks/bridge/network/nameservers", r#"["8.8.8.8"]"#);
        s.insert("mounts/data/source", "label:data");
        s.insert("mounts/data/path", "/var/lib/data");
        s.insert("mounts/data/copy_mode", "copy_new");
        s
    }

    #[tokio::test]
    async fn test_decode_schema() {
        let mut cfg = ExecutorConfig::default();
        cfg.decode(&store()).await.unwrap();

        assert_eq!(cfg.id, "deadbeef");
        assert_eq!(cfg.debug_level, 2);
        assert_eq!(cfg.session_ids(), vec!["deadbeef"]);

        let s = cfg.session("deadbeef").unwrap();
        let c = s.config();
        assert_eq!(c.id, "deadbeef");
        assert_eq!(c.cmd.args, vec!["date", "--reference=/"]);
        assert!(c.active);
        assert!(!c.tty);
        assert_eq!(cfg.execs["helper"].kind(), SessionKind::Exec);

        let ep = cfg.networks["bridge"].lock().await;
        assert_eq!(ep.id, "192");
        assert!(ep.is_static);
        assert_eq!(ep.ip.unwrap().to_string(), "127.0.0.2/24");
        assert!(ep.network.default);
        assert_eq!(ep.network.nameservers, vec!["8.8.8.8".parse::<IpAddr>().unwrap()]);
        drop(ep);

        assert!(cfg.mounts["data"].copy_new);
    }

    #[tokio::test]
    async fn test_decode_keeps_handles_and_runtime_state() {
        let source = store();
        let mut cfg = ExecutorConfig::default();
        cfg.decode(&source).await.unwrap();

        let session = cfg.sessions["deadbeef"].clone();
        let endpoint = cfg.networks["bridge"].clone();
        {
            let mut ep = endpoint.lock().await;
            ep.assigned = "127.0.0.2/24".parse().unwrap();
            ep.configured = true;
        }

        source.insert("sessions/deadbeef/restart", "true");
        cfg.decode(&source).await.unwrap();

        assert!(Arc::ptr_eq(&session, &cfg.sessions["deadbeef"]));
        assert!(session.config().restart);
        assert!(Arc::ptr_eq(&endpoint, &cfg.networks["bridge"]));
        let ep = endpoint.lock().await;
        assert_eq!(ep.assigned.to_string(), "127.0.0.2/24");
        assert!(!ep.configured);
    }

    #[tokio::test]
    async fn test_removed_sessions_are_dropped() {
        let source = store();
        let mut cfg = ExecutorConfig::default();
        cfg.decode(&source).await.unwrap();
        source.remove_prefix("execs/");
        cfg.decode(&source).await.unwrap();
        assert!(cfg.execs.is_empty());
    }

    #[tokio::test]
    async fn test_bad_values_are_config_errors() {
        let source = store();
        source.insert("sessions/deadbeef/tty", "yes");
        let mut cfg = ExecutorConfig::default();
        assert!(matches!(
            cfg.decode(&source).await,
            Err(ExecutorError::Config(_))
        ));

        let source = store();
        source.insert("mounts/data/source", "ds://datastore/vol");
        let mut cfg = ExecutorConfig::default();
        assert!(matches!(cfg.decode(&source).await, Err(ExecutorError::Mount(_))));
    }

    #[test]
    fn test_endpoint_writer_flushes_renewals() {
        let store = Arc::new(MapStore::new());
        let writer = EndpointWriter::new(store.clone());
        let ep = NetworkEndpoint {
            key: "client".into(),
            assigned: "10.0.0.10/24".parse().unwrap(),
            ..Default::default()
        };
        writer.endpoint_updated(&ep);
        assert_eq!(store.get("networks/client/assigned").as_deref(), Some("10.0.0.10/24"));
    }

    #[test]
    fn test_encode_endpoint() {
        let sink = MapStore::new();
        let ep = NetworkEndpoint {
            key: "client".into(),
            assigned: "10.0.0.9/24".parse().unwrap(),
            network: Network {
                assigned_gateway: "10.0.0.1/24".parse().unwrap(),
                assigned_nameservers: vec!["10.0.0.1".parse().unwrap()],
                ..Default::default()
            },
            ..Default::default()
        };
        encode_endpoint(&sink, &ep).unwrap();
        assert_eq!(sink.get("networks/client/assigned").as_deref(), Some("10.0.0.9/24"));
        assert_eq!(
            sink.get("networks/client/network/assigned/nameservers").as_deref(),
            Some(r#"["10.0.0.1"]"#)
        );
    }
}
