//! Resolving a session's program path before launch.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookPathError {
    #[error("stat {0}: no such file or directory")]
    NotFound(String),

    #[error("{0}: permission denied")]
    NotExecutable(String),

    #[error("stat {path}: {source}")]
    Stat { path: String, source: io::Error },

    #[error("{0}: no such executable in PATH")]
    NotInPath(String),
}

fn find_executable(file: &str) -> Result<(), LookPathError> {
    let meta = match fs::metadata(file) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(LookPathError::NotFound(file.to_string()));
        }
        Err(source) => {
            return Err(LookPathError::Stat {
                path: file.to_string(),
                source,
            });
        }
    };
    if !meta.is_dir() && meta.permissions().mode() & 0o111 != 0 {
        Ok(())
    } else {
        Err(LookPathError::NotExecutable(file.to_string()))
    }
}

/// Resolve `file` the way the session will be launched.
///
/// `./x` and `../x` are taken relative to `dir`, anything else containing a
/// slash is used as is, and a bare name is searched for in the `PATH` entry of
/// `env` (an empty element meaning the current directory).
pub fn lookpath(file: &str, env: &[String], dir: &str) -> Result<PathBuf, LookPathError> {
    if file.starts_with("./") || file.starts_with("../") {
        let joined = format!("{}/{}", dir, file);
        find_executable(&joined)?;
        return Ok(PathBuf::from(joined));
    }

    if file.contains('/') {
        find_executable(file)?;
        return Ok(PathBuf::from(file));
    }

    let path = env
        .iter()
        .find_map(|v| v.strip_prefix("PATH="))
        .unwrap_or("");
    for dir in path.split(':') {
        let dir = if dir.is_empty() { "." } else { dir };
        let candidate = format!("{}/{}", dir, file);
        if find_executable(&candidate).is_ok() {
            return Ok(PathBuf::from(candidate));
        }
    }

    Err(LookPathError::NotInPath(file.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write(path: &Path, mode: u32) {
        fs::write(path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_relative_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path().to_str().unwrap();
        write(&dir.path().join("x"), 0o755);

        let got = lookpath("./x", &[], d).unwrap();
        assert_eq!(got, PathBuf::from(format!("{}/./x", d)));

        write(&dir.path().join("y"), 0o644);
        let err = lookpath("./y", &[], d).unwrap_err();
        assert!(matches!(err, LookPathError::NotExecutable(_)));

        let err = lookpath("./missing", &[], d).unwrap_err();
        assert!(err.to_string().contains("no such file or directory"));
    }

    #[test]
    fn test_path_search_takes_first_executable() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write(&a.path().join("x"), 0o644);
        write(&b.path().join("x"), 0o755);
        let env = vec![format!(
            "PATH={}:{}",
            a.path().display(),
            b.path().display()
        )];

        assert_eq!(lookpath("x", &env, "/").unwrap(), b.path().join("x"));

        write(&a.path().join("x"), 0o755);
        assert_eq!(lookpath("x", &env, "/").unwrap(), a.path().join("x"));

        let err = lookpath("nope", &env, "/").unwrap_err();
        assert_eq!(err.to_string(), "nope: no such executable in PATH");
    }

    #[test]
    fn test_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let x = dir.path().join("x");
        write(&x, 0o700);
        assert_eq!(lookpath(x.to_str().unwrap(), &[], "/").unwrap(), x);

        let err = lookpath("/not/there", &[], "/").unwrap_err();
        assert_eq!(err.to_string(), "stat /not/there: no such file or directory");

        let err = lookpath(dir.path().to_str().unwrap(), &[], "/").unwrap_err();
        assert!(matches!(err, LookPathError::NotExecutable(_)));
    }

    #[test]
    fn test_empty_path_element_is_cwd() {
        let env = vec!["PATH=:/nonexistent".to_string()];
        let err = lookpath("definitely-not-here", &env, "/").unwrap_err();
        assert!(err.to_string().contains("no such executable in PATH"));
    }
}
