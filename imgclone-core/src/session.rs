//! Runtime state of one clone: scratch mount points, the attached virtual
//! device, the fresh disk identifier and the metadata resolved per partition.
use crate::build::ResolvedMetadata;
use crate::error::ToolError;
use crate::tools::{LoopDevices, Mounter};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A scratch directory that partitions are mounted on, one at a time.
///
/// The directory is removed with a non-recursive `remove_dir`, so a mount
/// that could not be released never has its contents deleted.
#[derive(Debug)]
pub struct MountPoint {
    path: PathBuf,
    mounted: Option<PathBuf>,
}

impl MountPoint {
    /// Creates a fresh directory under the system temp dir.
    pub fn create(prefix: &str) -> io::Result<Self> {
        let path = tempfile::Builder::new().prefix(prefix).tempdir()?.keep();
        debug!("mount point {}", path.display());
        Ok(MountPoint {
            path,
            mounted: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The device currently mounted here.
    pub fn mounted(&self) -> Option<&Path> {
        self.mounted.as_deref()
    }

    pub fn mount<M: Mounter + ?Sized>(
        &mut self,
        host: &M,
        device: &Path,
        read_only: bool,
    ) -> Result<(), ToolError> {
        host.mount(device, &self.path, read_only)?;
        self.mounted = Some(device.to_path_buf());
        Ok(())
    }

    /// Unmounts whatever is mounted here; a no-op when nothing is.
    pub fn unmount<M: Mounter + ?Sized>(&mut self, host: &M) -> Result<(), ToolError> {
        if self.mounted.is_some() {
            host.unmount(&self.path)?;
            self.mounted = None;
        }
        Ok(())
    }

    fn remove(&self) {
        if let Err(e) = fs::remove_dir(&self.path) {
            warn!("could not remove {}: {e}", self.path.display());
        }
    }
}

/// State owned by the orchestrator for the lifetime of one job.
#[derive(Debug)]
pub struct CloneSession {
    pub source_mount: MountPoint,
    pub destination_mount: MountPoint,
    /// Attached virtual block device, if any.
    pub device: Option<PathBuf>,
    /// Fresh disk identifier, 8 lowercase hex digits.
    pub new_disk_id: String,
    pub resolved: BTreeMap<u32, ResolvedMetadata>,
}

impl CloneSession {
    pub fn start() -> io::Result<Self> {
        Ok(CloneSession {
            source_mount: MountPoint::create("imgclone-src-")?,
            destination_mount: MountPoint::create("imgclone-dst-")?,
            device: None,
            new_disk_id: new_disk_id(),
            resolved: BTreeMap::new(),
        })
    }

    /// Releases everything still held: unmounts both mount points, detaches
    /// the device and removes the scratch directories. Every step is
    /// best-effort.
    pub fn teardown<H: Mounter + LoopDevices + ?Sized>(&mut self, host: &H) {
        for mount in [&mut self.destination_mount, &mut self.source_mount] {
            if let Err(e) = mount.unmount(host) {
                warn!("could not unmount {}: {e}", mount.path().display());
            }
        }
        if let Some(device) = self.device.take() {
            if let Err(e) = host.detach(&device) {
                warn!("could not detach {}: {e}", device.display());
            }
        }
        for mount in [&self.destination_mount, &self.source_mount] {
            if mount.mounted().is_none() {
                mount.remove();
            }
        }
    }
}

/// The first 8 hex digits of a random v4 UUID.
pub fn new_disk_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_id_is_eight_hex_digits() {
        let id = new_disk_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn mount_point_is_created_and_removed_empty() {
        let mount = MountPoint::create("imgclone-test-").unwrap();
        let path = mount.path().to_path_buf();
        assert!(path.is_dir());
        mount.remove();
        assert!(!path.exists());
    }

    #[test]
    fn removal_never_deletes_contents() {
        let mount = MountPoint::create("imgclone-test-").unwrap();
        let file = mount.path().join("cmdline.txt");
        fs::write(&file, "root=PARTUUID=6c3d2f1a-02").unwrap();
        mount.remove();
        assert!(file.exists());
        fs::remove_dir_all(mount.path()).unwrap();
    }
}
