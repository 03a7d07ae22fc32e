//! `/etc/hosts` and `/etc/resolv.conf`, rewritten whole on every save.

use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::NetError;

pub const HOSTS_PATH: &str = "etc/hosts";
pub const RESOLV_CONF_PATH: &str = "etc/resolv.conf";

fn write_atomic(path: &Path, contents: &str) -> Result<(), NetError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(contents.as_bytes())?;
    f.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Hosts {
    path: PathBuf,
    /// One address per name, in insertion order.
    entries: Vec<(String, IpAddr)>,
}

impl Hosts {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(HOSTS_PATH),
            entries: Vec::new(),
        }
    }

    /// Merge in whatever the file currently holds. A missing file is empty.
    pub fn load(&mut self) -> Result<(), NetError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let mut fields = line.split_whitespace();
            let Some(Ok(addr)) = fields.next().map(str::parse::<IpAddr>) else {
                continue;
            };
            for name in fields {
                self.set_host(name, addr);
            }
        }
        Ok(())
    }

    pub fn set_host(&mut self, name: &str, addr: IpAddr) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = addr,
            None => self.entries.push((name.to_string(), addr)),
        }
    }

    pub fn remove_host(&mut self, name: &str) {
        self.entries.retain(|(n, _)| n != name);
    }

    pub fn host(&self, name: &str) -> Option<IpAddr> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, a)| *a)
    }

    pub fn save(&self) -> Result<(), NetError> {
        let mut out = String::new();
        for (name, addr) in &self.entries {
            out.push_str(&format!("{}\t{}\n", addr, name));
        }
        write_atomic(&self.path, &out)?;
        tracing::debug!("wrote {} host entries to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ResolvConf {
    path: PathBuf,
    nameservers: Vec<IpAddr>,
}

impl ResolvConf {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(RESOLV_CONF_PATH),
            nameservers: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_nameservers(&mut self, servers: &[IpAddr]) {
        for s in servers {
            if !self.nameservers.contains(s) {
                self.nameservers.push(*s);
            }
        }
    }

    pub fn remove_nameservers(&mut self, servers: &[IpAddr]) {
        self.nameservers.retain(|s| !servers.contains(s));
    }

    pub fn nameservers(&self) -> &[IpAddr] {
        &self.nameservers
    }

    pub fn save(&self) -> Result<(), NetError> {
        let mut out = String::new();
        for s in &self.nameservers {
            out.push_str(&format!("nameserver {}\n", s));
        }
        write_atomic(&self.path, &out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hosts_load_set_save() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(
            dir.path().join(HOSTS_PATH),
            "# comment\n127.0.0.1 localhost loopback\n::1 ip6-localhost\n",
        )
        .unwrap();

        let mut hosts = Hosts::new(dir.path());
        hosts.load().unwrap();
        assert_eq!(hosts.host("loopback"), Some("127.0.0.1".parse().unwrap()));

        hosts.set_host("bridge.localhost", "10.0.0.2".parse().unwrap());
        hosts.set_host("loopback", "127.0.0.2".parse().unwrap());
        hosts.save().unwrap();

        let written = fs::read_to_string(dir.path().join(HOSTS_PATH)).unwrap();
        assert!(written.contains("127.0.0.1\tlocalhost\n"));
        assert!(written.contains("127.0.0.2\tloopback\n"));
        assert!(written.contains("10.0.0.2\tbridge.localhost\n"));
        assert!(!written.contains("comment"));
    }

    #[test]
    fn test_resolv_conf_dedupes_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let mut rc = ResolvConf::new(dir.path());
        let a: IpAddr = "8.8.8.8".parse().unwrap();
        let b: IpAddr = "1.1.1.1".parse().unwrap();
        rc.add_nameservers(&[a, b, a]);
        assert_eq!(rc.nameservers(), &[a, b]);
        rc.remove_nameservers(&[a]);
        rc.save().unwrap();
        assert_eq!(
            fs::read_to_string(rc.path()).unwrap(),
            "nameserver 1.1.1.1\n"
        );
    }
}
