use std::fmt;
use std::path::PathBuf;

use crate::MountError;

/// Where a volume comes from, taken from the scheme of its source URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// Block device found by filesystem label.
    Label(String),
    /// `host:path` export.
    Nfs { host: String, path: String },
}

impl MountSource {
    pub fn parse(name: &str, uri: &str) -> Result<Self, MountError> {
        let unsupported = |scheme: &str| MountError::UnsupportedScheme {
            name: name.to_string(),
            scheme: scheme.to_string(),
        };
        let (scheme, rest) = uri.split_once(':').ok_or_else(|| unsupported(""))?;

        match scheme {
            "label" => {
                let label = rest.trim_start_matches('/').trim_end_matches('/');
                if label.is_empty() {
                    return Err(MountError::InvalidSpec(format!("{}: empty label in {}", name, uri)));
                }
                Ok(MountSource::Label(label.to_string()))
            }
            "nfs" => {
                let authority = rest.strip_prefix("//").ok_or_else(|| {
                    MountError::InvalidSpec(format!("{}: nfs source needs a host: {}", name, uri))
                })?;
                let (host, path) = match authority.find('/') {
                    Some(i) => (&authority[..i], &authority[i..]),
                    None => (authority, ""),
                };
                if host.is_empty() || path.len() < 2 {
                    return Err(MountError::InvalidSpec(format!(
                        "{}: nfs source needs host and path: {}",
                        name, uri
                    )));
                }
                Ok(MountSource::Nfs {
                    host: host.to_string(),
                    path: path.to_string(),
                })
            }
            other => Err(unsupported(other)),
        }
    }
}

impl fmt::Display for MountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountSource::Label(l) => write!(f, "label:{}", l),
            MountSource::Nfs { host, path } => write!(f, "nfs://{}{}", host, path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub name: String,
    pub source: MountSource,
    pub path: PathBuf,
    /// Comma separated mount options, e.g. `rw` or `ro,vers=4`.
    pub mode: String,
    /// Seed an empty volume with whatever the image had at `path`.
    pub copy_new: bool,
}

impl MountSpec {
    pub fn new(name: &str, source: &str, path: &str, mode: &str, copy_mode: &str) -> Result<Self, MountError> {
        let copy_new = match copy_mode {
            "" => false,
            "copy_new" => true,
            other => {
                return Err(MountError::InvalidSpec(format!(
                    "{}: unknown copy mode {}",
                    name, other
                )));
            }
        };
        if !path.starts_with('/') {
            return Err(MountError::InvalidSpec(format!(
                "{}: mount path must be absolute: {}",
                name, path
            )));
        }

        Ok(Self {
            name: name.to_string(),
            source: MountSource::parse(name, source)?,
            path: PathBuf::from(path),
            mode: mode.to_string(),
            copy_new,
        })
    }

    pub fn read_only(&self) -> bool {
        self.options().any(|o| o == "ro")
    }

    /// Individual entries of `mode`.
    pub fn options(&self) -> impl Iterator<Item = &str> {
        self.mode.split(',').map(str::trim).filter(|o| !o.is_empty())
    }
}
