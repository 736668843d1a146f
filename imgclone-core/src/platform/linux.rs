use crate::tools::FsUsage;
use nix::ioctl_read;
use nix::sys::stat::{major, minor};
use nix::sys::statvfs::statvfs;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Space accounting for the file system containing `path`.
///
/// `used` counts every non-free block, `available` only the blocks an
/// unprivileged writer may still claim, matching what `df` reports.
pub fn filesystem_usage(path: &Path) -> io::Result<FsUsage> {
    let st = statvfs(path).map_err(io::Error::from)?;
    let fragment = st.fragment_size() as u64;
    let total = st.blocks() as u64 * fragment;
    let free = st.blocks_free() as u64 * fragment;
    let available = st.blocks_available() as u64 * fragment;
    Ok(FsUsage {
        total,
        used: total.saturating_sub(free),
        available,
    })
}

/// Finds the device node (e.g. `/dev/sda1`) backing the file system that
/// contains `path`.
///
/// The path's own `st_dev` decides. A major number of 0 is an anonymous
/// device (tmpfs, NFS, CIFS, FUSE) with no block device behind it, so the
/// answer is `None`. Otherwise the node is read from
/// `/sys/dev/block/<major>:<minor>`. Only when sysfs has no entry is the
/// mounted-disk list consulted, and then only mounts on that same device.
pub fn backing_device(path: &Path) -> io::Result<Option<String>> {
    let path = fs::canonicalize(path)?;
    let dev = fs::metadata(&path)?.dev();
    if major(dev) == 0 {
        return Ok(None);
    }
    if let Some(node) = device_from_sysfs(dev)? {
        return Ok(Some(node));
    }

    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mounted = disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .filter(|disk| {
            fs::metadata(disk.mount_point()).is_ok_and(|meta| meta.dev() == dev)
        })
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| {
            PathBuf::from("/dev/")
                .join(disk.name())
                .to_string_lossy()
                .into_owned()
        });
    Ok(mounted.filter(|name| name != "/dev/root"))
}

fn device_from_sysfs(dev: u64) -> io::Result<Option<String>> {
    let link = PathBuf::from(format!("/sys/dev/block/{}:{}", major(dev), minor(dev)));
    match fs::read_link(&link) {
        Ok(target) => Ok(node_name(&target)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// `../../devices/platform/.../mmcblk0/mmcblk0p2` -> `/dev/mmcblk0p2`
fn node_name(sysfs_target: &Path) -> Option<String> {
    sysfs_target
        .file_name()
        .map(|name| format!("/dev/{}", name.to_string_lossy()))
}

/// The size of the block device at `path` in bytes.
pub fn block_device_size(path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    let mut size_bytes: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size_bytes).map_err(io::Error::from)?;
    }
    Ok(size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_of_temp_dir_is_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let usage = filesystem_usage(dir.path()).unwrap();
        assert!(usage.total >= usage.used);
        assert!(usage.total >= usage.available);
    }

    #[test]
    fn pseudo_file_systems_have_no_backing_device() {
        assert_eq!(backing_device(Path::new("/proc")).unwrap(), None);
        let shm = Path::new("/dev/shm");
        if shm.is_dir() && major(fs::metadata(shm).unwrap().dev()) == 0 {
            assert_eq!(backing_device(shm).unwrap(), None);
        }
    }

    #[test]
    fn sysfs_link_names_the_partition_node() {
        let target = Path::new("../../devices/platform/emmc2bus/fe340000.mmc/mmc_host/mmc0/mmc0:aaaa/block/mmcblk0/mmcblk0p2");
        assert_eq!(node_name(target).as_deref(), Some("/dev/mmcblk0p2"));
    }

    #[test]
    fn block_size_of_regular_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(block_device_size(file.path()).is_err());
    }
}
