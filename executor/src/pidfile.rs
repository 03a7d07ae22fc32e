use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Per-command pid files under `<root>/<dir>/`.
#[derive(Debug, Clone)]
pub struct PidFiles {
    dir: PathBuf,
}

impl PidFiles {
    pub fn new(root: &Path, dir: &str) -> Self {
        Self {
            dir: root.join(dir.trim_start_matches('/')),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pid file for a command, named after the basename of its path.
    pub fn path_for(&self, command: &str) -> PathBuf {
        let base = Path::new(command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.replace('/', "_"));
        self.dir.join(format!("{}.pid", base))
    }

    pub fn create_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    pub fn write(&self, command: &str, pid: i32) -> io::Result<PathBuf> {
        let path = self.path_for(command);
        fs::write(&path, format!("{}", pid))?;
        Ok(path)
    }

    pub fn remove(&self, command: &str) {
        let path = self.path_for(command);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("unable to remove pid file {:?}: {}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pidfile_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let pids = PidFiles::new(root.path(), ".tether");
        pids.create_dir().unwrap();

        let path = pids.write("/usr/sbin/nginx", 42).unwrap();
        assert_eq!(path, root.path().join(".tether/nginx.pid"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "42");

        pids.remove("/usr/sbin/nginx");
        assert!(!path.exists());
        pids.remove("/usr/sbin/nginx");
    }
}
