use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::mount::{MntFlags, MsFlags, mount, umount2};

use crate::error::MountError;

pub const BY_LABEL_DIR: &str = "/dev/disk/by-label";

/// Filesystem label lookup, polling until the device node shows up.
#[derive(Debug, Clone)]
pub struct LabelDir {
    dir: PathBuf,
    timeout: Duration,
    poll: Duration,
}

impl Default for LabelDir {
    fn default() -> Self {
        Self::new(BY_LABEL_DIR)
    }
}

impl LabelDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            timeout: Duration::from_secs(60),
            poll: Duration::from_millis(100),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Device path for `label` once it exists.
    pub fn wait(&self, label: &str) -> Result<PathBuf, MountError> {
        let device = self.dir.join(label);
        let deadline = Instant::now() + self.timeout;
        loop {
            match device.try_exists() {
                Ok(true) => return Ok(device),
                Ok(false) => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(MountError::Timeout(device.display().to_string()));
            }
            std::thread::sleep(self.poll);
        }
    }
}

/// Mount the ext4 volume carrying `label` on `target`.
pub fn mount_label(labels: &LabelDir, label: &str, target: &Path, read_only: bool) -> Result<(), MountError> {
    std::fs::create_dir_all(target)
        .map_err(|e| MountError::MountFailed(format!("unable to create mount point {}: {}", target.display(), e)))?;
    let device = labels.wait(label)?;

    let mut flags = MsFlags::MS_NOATIME;
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }

    tracing::info!("Mounting {:?} on {:?}", device, target);
    mount(Some(&device), target, Some("ext4"), flags, None::<&str>).map_err(|e| {
        MountError::MountFailed(format!(
            "mounting {} on {} failed: {}",
            device.display(),
            target.display(),
            e
        ))
    })?;
    Ok(())
}

/// Kernel NFS mount data: caller options plus the resolved server address.
pub fn nfs_options(host: &str, options: &[&str]) -> Result<String, MountError> {
    let addr: IpAddr = match host.parse() {
        Ok(ip) => ip,
        Err(_) => (host, 0)
            .to_socket_addrs()
            .map_err(|e| MountError::MountFailed(format!("unable to resolve {}: {}", host, e)))?
            .next()
            .map(|sa| sa.ip())
            .ok_or_else(|| MountError::MountFailed(format!("no address for {}", host)))?,
    };

    let mut data: Vec<String> = options
        .iter()
        .filter(|o| !matches!(**o, "ro" | "rw"))
        .map(|o| o.to_string())
        .collect();
    data.push(format!("addr={}", addr));
    Ok(data.join(","))
}

pub fn mount_nfs(host: &str, path: &str, target: &Path, options: &[&str]) -> Result<(), MountError> {
    std::fs::create_dir_all(target)?;
    let source = format!("{}:{}", host, path);
    let data = nfs_options(host, options)?;

    let mut flags = MsFlags::empty();
    if options.contains(&"ro") {
        flags |= MsFlags::MS_RDONLY;
    }

    tracing::info!("Mounting {} on {:?} with options: {}", source, target, data);
    mount(Some(source.as_str()), target, Some("nfs"), flags, Some(data.as_str()))
        .map_err(|e| MountError::MountFailed(format!("nfs mount of {} failed: {}", source, e)))?;
    Ok(())
}

/// Non-recursive bind mount: submounts of `source` are not carried over.
pub fn bind(source: &Path, target: &Path) -> Result<(), MountError> {
    tracing::debug!("Bind mounting {:?} to {:?}", source, target);
    mount(Some(source), target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
        .map_err(|e| MountError::MountFailed(format!("bind mount failed: {}", e)))?;
    Ok(())
}

/// Unmount a filesystem at the given path.
pub fn unmount(target: &Path) -> Result<(), MountError> {
    tracing::debug!("Unmounting {:?}", target);

    umount2(target, MntFlags::MNT_DETACH)
        .map_err(|e| MountError::UnmountFailed(format!("unmount failed: {}", e)))?;

    tracing::info!("Unmounted {:?}", target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_wait_finds_existing_device() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data"), b"").unwrap();
        let labels = LabelDir::new(dir.path());
        assert_eq!(labels.wait("data").unwrap(), dir.path().join("data"));
    }

    #[test]
    fn test_label_wait_sees_late_device() {
        let dir = tempfile::tempdir().unwrap();
        let late = dir.path().join("late");
        let creator = {
            let late = late.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(150));
                std::fs::write(late, b"").unwrap();
            })
        };
        let labels = LabelDir::new(dir.path()).timeout(Duration::from_secs(5));
        assert_eq!(labels.wait("late").unwrap(), late);
        creator.join().unwrap();
    }

    #[test]
    fn test_label_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let labels = LabelDir::new(dir.path()).timeout(Duration::from_millis(200));
        let err = labels.wait("missing").unwrap_err();
        assert!(matches!(err, MountError::Timeout(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_nfs_options_carry_address() {
        let data = nfs_options("10.0.0.5", &["rw", "vers=4", "hard"]).unwrap();
        assert_eq!(data, "vers=4,hard,addr=10.0.0.5");
        assert_eq!(nfs_options("127.0.0.1", &[]).unwrap(), "addr=127.0.0.1");
    }
}
