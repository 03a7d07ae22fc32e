//! Link, address and route manipulation.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::errno::Errno;

use crate::pci::{pci_to_link_name, slot_to_pci_path, PCI_DEV_PATH};
use crate::{IpNet, NetError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub alias: String,
    pub mac: Option<[u8; 6]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub link: String,
    pub dst: IpNet,
    pub gateway: Option<IpAddr>,
    pub table: Option<u32>,
}

/// The kernel networking operations the engine needs.
///
/// Failures come back as [`NetError::Netlink`] with the kernel errno, so the
/// caller can ignore EEXIST, EADDRNOTAVAIL and ESRCH where those are benign.
pub trait Netlink: Send + Sync {
    fn link_by_name(&self, name: &str) -> Result<Link, NetError>;
    fn link_by_slot(&self, slot: u32) -> Result<Link, NetError>;
    fn set_up(&self, link: &Link) -> Result<(), NetError>;
    fn set_down(&self, link: &Link) -> Result<(), NetError>;
    fn set_name(&self, link: &Link, name: &str) -> Result<(), NetError>;
    fn set_alias(&self, link: &Link, alias: &str) -> Result<(), NetError>;
    fn addr_add(&self, link: &Link, addr: &IpNet) -> Result<(), NetError>;
    fn addr_del(&self, link: &Link, addr: &IpNet) -> Result<(), NetError>;
    fn route_add(&self, route: &Route) -> Result<(), NetError>;
    fn route_del(&self, route: &Route) -> Result<(), NetError>;
    /// Whether a policy routing table has any routes.
    fn has_table(&self, table: u32) -> bool;
}

/// [`Netlink`] backed by sysfs for lookups and the `ip` tool for changes.
pub struct IpCommand {
    root: PathBuf,
    ip: PathBuf,
    spawn_lock: Option<SpawnLock>,
}

/// Held for the lifetime of each `ip` invocation, so a process-wide reaper
/// cannot collect the child before its status is read.
pub type SpawnLock = Box<dyn Fn() -> Box<dyn std::any::Any> + Send + Sync>;

impl IpCommand {
    /// `root` prefixes every sysfs path; `/` on a real guest.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ip: PathBuf::from("ip"),
            spawn_lock: None,
        }
    }

    pub fn with_binary(mut self, ip: impl Into<PathBuf>) -> Self {
        self.ip = ip.into();
        self
    }

    pub fn with_spawn_lock(mut self, lock: SpawnLock) -> Self {
        self.spawn_lock = Some(lock);
        self
    }

    fn run<S: AsRef<str>>(&self, op: &'static str, args: &[S]) -> Result<String, NetError> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        tracing::debug!("{} {}", self.ip.display(), args.join(" "));
        let out = {
            let _held = self.spawn_lock.as_ref().map(|lock| lock());
            // errno is parsed from the untranslated message
            Command::new(&self.ip).env("LC_ALL", "C").args(&args).output()?
        };
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        Err(NetError::Netlink {
            op,
            errno: errno_from_message(&stderr),
            detail: stderr,
        })
    }

    fn sys_class_net(&self, name: &str) -> PathBuf {
        self.root.join("sys/class/net").join(name)
    }
}

/// Recover the errno from `ip`'s "RTNETLINK answers: ..." text.
fn errno_from_message(msg: &str) -> Errno {
    const KNOWN: &[(&str, Errno)] = &[
        ("File exists", Errno::EEXIST),
        ("Cannot assign requested address", Errno::EADDRNOTAVAIL),
        ("No such process", Errno::ESRCH),
        ("Operation not permitted", Errno::EPERM),
        ("No such device", Errno::ENODEV),
        ("Cannot find device", Errno::ENODEV),
        ("Device or resource busy", Errno::EBUSY),
        ("Network is unreachable", Errno::ENETUNREACH),
        ("Invalid argument", Errno::EINVAL),
    ];
    KNOWN
        .iter()
        .find(|(text, _)| msg.contains(text))
        .map(|(_, errno)| *errno)
        .unwrap_or(Errno::EIO)
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.trim().split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

impl Netlink for IpCommand {
    fn link_by_name(&self, name: &str) -> Result<Link, NetError> {
        let dir = self.sys_class_net(name);
        let index = read_trimmed(&dir.join("ifindex"))
            .and_then(|s| s.parse().ok())
            .ok_or(NetError::Netlink {
                op: "link lookup",
                errno: Errno::ENODEV,
                detail: format!("no link named {}", name),
            })?;

        Ok(Link {
            index,
            name: name.to_string(),
            alias: read_trimmed(&dir.join("ifalias")).unwrap_or_default(),
            mac: read_trimmed(&dir.join("address")).and_then(|s| parse_mac(&s)),
        })
    }

    fn link_by_slot(&self, slot: u32) -> Result<Link, NetError> {
        let pci = slot_to_pci_path(&self.root.join(PCI_DEV_PATH), slot);
        let name = pci_to_link_name(&pci, slot)?;
        tracing::debug!("got link name: {}", name);
        self.link_by_name(&name)
    }

    fn set_up(&self, link: &Link) -> Result<(), NetError> {
        self.run("link set up", &["link", "set", "dev", &link.name, "up"])
            .map(drop)
    }

    fn set_down(&self, link: &Link) -> Result<(), NetError> {
        self.run("link set down", &["link", "set", "dev", &link.name, "down"])
            .map(drop)
    }

    fn set_name(&self, link: &Link, name: &str) -> Result<(), NetError> {
        self.run("link rename", &["link", "set", "dev", &link.name, "name", name])
            .map(drop)
    }

    fn set_alias(&self, link: &Link, alias: &str) -> Result<(), NetError> {
        self.run("link alias", &["link", "set", "dev", &link.name, "alias", alias])
            .map(drop)
    }

    fn addr_add(&self, link: &Link, addr: &IpNet) -> Result<(), NetError> {
        let cidr = addr.to_string();
        self.run("addr add", &["addr", "add", &cidr, "dev", &link.name])
            .map(drop)
    }

    fn addr_del(&self, link: &Link, addr: &IpNet) -> Result<(), NetError> {
        let cidr = addr.to_string();
        self.run("addr del", &["addr", "del", &cidr, "dev", &link.name])
            .map(drop)
    }

    fn route_add(&self, route: &Route) -> Result<(), NetError> {
        self.run("route add", &route_args("add", route)[..]).map(drop)
    }

    fn route_del(&self, route: &Route) -> Result<(), NetError> {
        self.run("route del", &route_args("del", route)[..]).map(drop)
    }

    fn has_table(&self, table: u32) -> bool {
        let table = table.to_string();
        self.run("route show", &["route", "show", "table", &table])
            .map(|out| !out.trim().is_empty())
            .unwrap_or(false)
    }
}

fn route_args(verb: &str, route: &Route) -> Vec<String> {
    let mut args = vec!["route".to_string(), verb.to_string(), route.dst.to_string()];
    if let Some(gw) = route.gateway {
        args.push("via".into());
        args.push(gw.to_string());
    }
    args.push("dev".into());
    args.push(route.link.clone());
    if let Some(table) = route.table {
        args.push("table".into());
        args.push(table.to_string());
    }
    args
}
