//! Seeding a freshly mounted volume with the content it covers up.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt, lchown, symlink};
use std::path::Path;

use crate::MountError;
use crate::ops::{bind, unmount};

/// True when `dir` holds nothing but a `lost+found` directory.
pub fn is_empty_volume(dir: &Path) -> Result<bool, MountError> {
    for entry in fs::read_dir(dir)? {
        if entry?.file_name() != "lost+found" {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Recursively copy `src` into the existing directory `dst`, keeping modes,
/// ownership and symlinks.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), MountError> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&from)?;
        let kind = meta.file_type();

        if kind.is_symlink() {
            symlink(fs::read_link(&from)?, &to)?;
        } else if kind.is_dir() {
            fs::create_dir_all(&to)?;
            copy_tree(&from, &to)?;
            fs::set_permissions(&to, fs::Permissions::from_mode(meta.mode()))?;
        } else if kind.is_file() {
            fs::copy(&from, &to)?;
        } else {
            tracing::debug!("skipping special file {:?}", from);
            continue;
        }

        if let Err(e) = lchown(&to, Some(meta.uid()), Some(meta.gid())) {
            tracing::warn!("unable to set ownership of {:?}: {}", to, e);
        }
    }
    Ok(())
}

/// Copy what the image holds at `target` into the volume now mounted there.
///
/// The original content is reached through a non-recursive bind of the parent
/// directory, which does not carry the volume mount. Non-empty volumes are
/// left untouched. Returns whether a copy happened.
pub fn copy_new(target: &Path, staging: &Path) -> Result<bool, MountError> {
    if !is_empty_volume(target)? {
        tracing::debug!("volume at {:?} is not empty, skipping copy", target);
        return Ok(false);
    }

    let (parent, leaf) = match (target.parent(), target.file_name()) {
        (Some(p), Some(l)) => (p, l),
        _ => {
            return Err(MountError::InvalidSpec(format!(
                "cannot copy into {}",
                target.display()
            )));
        }
    };

    fs::create_dir_all(staging)?;
    bind(parent, staging)?;
    let hidden = staging.join(leaf);
    let copied = if hidden.is_dir() {
        tracing::info!("copying existing content from {:?} into new volume", target);
        copy_tree(&hidden, target)
    } else {
        Ok(())
    };

    let released = unmount(staging);
    let _ = fs::remove_dir(staging);
    copied?;
    released?;
    Ok(true)
}
