//! Volume mounts for the guest.

mod copy;
mod error;
mod ops;
mod spec;

use std::path::Path;

pub use copy::{copy_new, copy_tree, is_empty_volume};
pub use error::MountError;
pub use ops::{BY_LABEL_DIR, LabelDir, bind, mount_label, mount_nfs, nfs_options, unmount};
pub use spec::{MountSource, MountSpec};

/// Mount one volume, dispatching on its source, then seed it if asked to.
///
/// `staging` is a scratch directory used while copying existing content.
pub fn mount_volume(spec: &MountSpec, labels: &LabelDir, staging: &Path) -> Result<(), MountError> {
    tracing::info!("mounting {} ({}) on {:?}", spec.name, spec.source, spec.path);
    let options: Vec<&str> = spec.options().collect();

    match &spec.source {
        MountSource::Label(label) => mount_label(labels, label, &spec.path, spec.read_only())?,
        MountSource::Nfs { host, path } => mount_nfs(host, path, &spec.path, &options)?,
    }

    if spec.copy_new {
        copy_new(&spec.path, staging)?;
    }
    Ok(())
}
