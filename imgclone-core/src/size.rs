//! Computes how large the destination image must be.
//!
//! Everything up to the start of the last partition is kept as laid out on the
//! source. The last partition only needs room for the data it currently holds,
//! plus a safety margin and any extra free space the caller asked for.
use crate::device::partition_path;
use crate::error::{CloneError, MountStage};
use crate::partition::{PartitionDescriptor, SECTOR_SIZE};
use crate::session::MountPoint;
use crate::tools::{Mounter, SpaceProbe};
use std::path::Path;
use tracing::info;

/// The breakdown of a computed image size, all in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEstimate {
    pub last_start: u64,
    pub used: u64,
    pub margin: u64,
    pub extra: u64,
    /// The final, sector-aligned size of the image file.
    pub required: u64,
}

/// Rounds `bytes` up to the next multiple of [`SECTOR_SIZE`].
pub fn align_to_sector(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

/// Combines the layout and measured usage into `required` bytes.
///
/// `required = last_start * 512 + used * (1 + margin) + extra`, rounded up to
/// a whole sector.
pub fn compute(last_start_sector: u64, used: u64, margin_percent: u64, extra: u64) -> SizeEstimate {
    let last_start = last_start_sector * SECTOR_SIZE;
    let margin = (used * margin_percent).div_ceil(100);
    SizeEstimate {
        last_start,
        used,
        margin,
        extra,
        required: align_to_sector(last_start + used + margin + extra),
    }
}

/// Measures the source's last partition and computes the image size.
///
/// The partition is mounted read-only on `mount` for the measurement and
/// unmounted again whether or not the measurement succeeded.
pub fn estimate<H: Mounter + SpaceProbe + ?Sized>(
    host: &H,
    source: &Path,
    parts: &[PartitionDescriptor],
    mount: &mut MountPoint,
    margin_percent: u64,
    extra: u64,
) -> Result<SizeEstimate, CloneError> {
    // The reader never returns an empty table.
    let Some(last) = parts.last() else {
        return Ok(compute(0, 0, margin_percent, extra));
    };
    info!("last partition starts at {} bytes", last.start_bytes());

    let partition = partition_path(source, last.ordinal);
    mount
        .mount(host, &partition, true)
        .map_err(|source| CloneError::MountFailed {
            stage: MountStage::Estimate,
            device: partition.clone(),
            source,
        })?;

    let usage = host.usage(mount.path());
    let unmounted = mount.unmount(host);

    let usage = usage.map_err(|source| CloneError::MountFailed {
        stage: MountStage::Estimate,
        device: partition.clone(),
        source,
    })?;
    unmounted.map_err(|source| CloneError::UnmountFailed {
        stage: MountStage::Estimate,
        mount_point: mount.path().to_path_buf(),
        source,
    })?;

    // Measured against available, not free, so reserved blocks count as used.
    let used = usage.total.saturating_sub(usage.available);
    info!("used size of last partition is {used} bytes");

    let estimate = compute(last.start, used, margin_percent, extra);
    info!(
        "required size for destination image: {} bytes",
        estimate.required
    );
    Ok(estimate)
}
