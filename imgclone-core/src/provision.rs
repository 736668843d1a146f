//! Allocates the destination image file and attaches it as a block device.
//!
//! All checks that can reject the destination run before the file is created,
//! so a refused job leaves nothing behind.
use crate::device::is_on_device;
use crate::error::{CloneError, ToolError};
use crate::tools::{LoopDevices, SpaceProbe};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// The directory the destination file will live in.
fn destination_dir(destination: &Path) -> PathBuf {
    match destination.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Rejects destinations on the source card or without room for `required`
/// bytes.
pub fn check_destination<S: SpaceProbe + ?Sized>(
    probe: &S,
    source: &Path,
    destination: &Path,
    required: u64,
) -> Result<(), CloneError> {
    let dir = destination_dir(destination);
    let failed = |source| CloneError::ProvisionFailed {
        path: destination.to_path_buf(),
        source,
    };

    if let Some(device) = probe.backing_device(&dir).map_err(failed)? {
        info!("destination {} is on {device}", destination.display());
        if is_on_device(&device, source) {
            return Err(CloneError::DestinationOnSourceDisk {
                path: destination.to_path_buf(),
                device,
            });
        }
    }

    let available = probe.usage(&dir).map_err(failed)?.available;
    if available < required {
        return Err(CloneError::InsufficientDestinationSpace {
            available,
            required,
        });
    }
    Ok(())
}

/// Creates `destination` and sets its length to exactly `size` bytes.
///
/// The file is sparse; a file left behind by a failed resize is removed.
pub fn allocate(destination: &Path, size: u64) -> Result<(), CloneError> {
    let failed = |e| CloneError::ProvisionFailed {
        path: destination.to_path_buf(),
        source: ToolError::io(destination, e),
    };

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(destination)
        .map_err(failed)?;
    if let Err(e) = file.set_len(size) {
        drop(file);
        if let Err(rm) = fs::remove_file(destination) {
            warn!("could not remove {}: {rm}", destination.display());
        }
        return Err(failed(e));
    }
    info!("allocated {size} bytes for {}", destination.display());
    Ok(())
}

/// Attaches `destination` as a virtual block device and checks that the
/// device reports exactly `size` bytes.
///
/// On a size mismatch the device is detached again before failing.
pub fn attach<L: LoopDevices + ?Sized>(
    loops: &L,
    destination: &Path,
    size: u64,
) -> Result<PathBuf, CloneError> {
    let failed = |source| CloneError::ProvisionFailed {
        path: destination.to_path_buf(),
        source,
    };

    let device = loops.attach(destination).map_err(failed)?;
    info!("attached {} as {}", destination.display(), device.display());

    let reported = match loops.device_size(&device) {
        Ok(reported) if reported == size => return Ok(device),
        Ok(reported) => ToolError::Unparsable {
            command: format!("size of {}", device.display()),
            detail: format!("device reports {reported} bytes, expected {size}"),
        },
        Err(e) => e,
    };
    if let Err(e) = loops.detach(&device) {
        warn!("could not detach {}: {e}", device.display());
    }
    Err(failed(reported))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_creates_a_sparse_file_of_exact_size() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("pi.img");
        allocate(&image, 64 * 1024 * 1024).unwrap();
        assert_eq!(fs::metadata(&image).unwrap().len(), 64 * 1024 * 1024);
    }

    #[test]
    fn allocate_reports_unwritable_directory() {
        let err = allocate(Path::new("/nonexistent-imgclone-dir/pi.img"), 512).unwrap_err();
        assert_eq!(err.exit_code(), 23);
    }

    #[test]
    fn destination_without_block_device_is_not_on_the_source() {
        // procfs has an anonymous device, like tmpfs and network shares.
        let host = crate::tools::SystemHost::new();
        let checked = check_destination(&host, Path::new("/dev/vda"), Path::new("/proc/pi.img"), 0);
        assert!(checked.is_ok(), "{checked:?}");
    }

    #[test]
    fn bare_file_name_lives_in_current_dir() {
        assert_eq!(destination_dir(Path::new("pi.img")), PathBuf::from("."));
        assert_eq!(
            destination_dir(Path::new("/mnt/usb/pi.img")),
            PathBuf::from("/mnt/usb")
        );
    }
}
