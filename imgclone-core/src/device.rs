//! Block device and partition node naming.
use std::path::{Path, PathBuf};

/// Returns the device node of partition `ordinal` on `device`.
///
/// Devices whose name ends in a digit (`/dev/mmcblk0`, `/dev/loop3`,
/// `/dev/nvme0n1`) take a `p` before the partition number; others
/// (`/dev/sda`) take the number directly.
pub fn partition_path(device: &Path, ordinal: u32) -> PathBuf {
    let name = device.to_string_lossy();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{name}p{ordinal}"))
    } else {
        PathBuf::from(format!("{name}{ordinal}"))
    }
}

/// Returns `true` if `candidate` names `device` or one of its partitions.
///
/// What follows the device name must be a partition number, with a `p`
/// separator when the device name ends in a digit, so `/dev/sda` does not
/// claim `/dev/sdaa1` and `/dev/mmcblk1` does not claim `/dev/mmcblk10p1`.
pub fn is_on_device(candidate: &str, device: &Path) -> bool {
    let device = device.to_string_lossy();
    if device.is_empty() {
        return false;
    }
    let Some(rest) = candidate.strip_prefix(device.as_ref()) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let number = if device.ends_with(|c: char| c.is_ascii_digit()) {
        rest.strip_prefix('p')
    } else {
        Some(rest)
    };
    number.is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}
