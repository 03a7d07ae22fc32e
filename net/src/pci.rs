//! PCI slot to kernel link resolution.
//!
//! The hypervisor identifies NICs by a packed slot number: device in bits
//! 0-4, bus in 5-9, function in 10-12. Devices behind a bridge are found
//! under the bridge's own device directory, the bridge for bus N sitting in
//! slot `0x11 + N - 1` of the root bus.

use std::path::{Path, PathBuf};

use crate::NetError;

pub const PCI_DEV_PATH: &str = "sys/bus/pci/devices";

/// The sysfs path, possibly containing a `*` bus wildcard, for a slot.
pub fn slot_to_pci_path(devices: &Path, slot: u32) -> PathBuf {
    let dev = slot & 0x1f;
    let bus = (slot >> 5) & 0x1f;
    let fun = (slot >> 10) & 0x7;
    if bus == 0 {
        return devices.join(format!("0000:{:02x}:{:02x}.{}", bus, dev, fun));
    }

    let bridge = slot_to_pci_path(devices, 0x11 + (bus - 1));
    bridge.join(format!("0000:*:{:02x}.{}", dev, fun))
}

/// The single network interface exposed by a PCI device directory.
pub fn pci_to_link_name(pci_path: &Path, slot: u32) -> Result<String, NetError> {
    let pattern = pci_path.join("net").join("*");
    let pattern = pattern.to_string_lossy().into_owned();
    let fail = |detail: String| NetError::Slot { slot, detail };

    let entries = glob::glob(&pattern).map_err(|e| fail(e.to_string()))?;
    let matches: Vec<PathBuf> = entries.filter_map(Result::ok).collect();
    match matches.as_slice() {
        [one] => one
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| fail(format!("bad match {}", one.display()))),
        [] => Err(fail(format!("no interface matches {}", pattern))),
        _ => Err(fail(format!("more than one interface matches {}", pattern))),
    }
}
