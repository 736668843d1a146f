//! Replaces the old disk identifier with the new one in the boot command line
//! and fstab of a freshly copied partition.
use crate::error::CloneError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Files, relative to a partition's root, that reference partitions by
/// `PARTUUID=<disk id>-<nn>`.
pub const REWRITE_TARGETS: &[&str] = &["cmdline.txt", "etc/fstab"];

/// Rewrites every occurrence of `old` with `new` in the files of
/// [`REWRITE_TARGETS`] found under `root`. Missing files are skipped.
///
/// Returns the files that were changed.
pub fn rewrite_disk_id(root: &Path, old: &str, new: &str) -> Result<Vec<PathBuf>, CloneError> {
    let mut changed = Vec::new();
    if old.is_empty() || old == new {
        return Ok(changed);
    }

    for target in REWRITE_TARGETS {
        let path = root.join(target);
        if !path.is_file() {
            continue;
        }
        let failed = |source| CloneError::UuidRewriteFailed {
            path: path.clone(),
            source,
        };
        let text = fs::read_to_string(&path).map_err(failed)?;
        if !text.contains(old) {
            continue;
        }
        fs::write(&path, text.replace(old, new)).map_err(failed)?;
        info!("updated disk id {old} -> {new} in {}", path.display());
        changed.push(path);
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_cmdline_on_boot_partition() {
        let root = tempfile::tempdir().unwrap();
        fs::write(
            root.path().join("cmdline.txt"),
            "console=serial0,115200 root=PARTUUID=6c3d2f1a-02 rootfstype=ext4 fsck.repair=yes rootwait\n",
        )
        .unwrap();

        let changed = rewrite_disk_id(root.path(), "6c3d2f1a", "b8f2e6a1").unwrap();
        assert_eq!(changed, vec![root.path().join("cmdline.txt")]);
        let text = fs::read_to_string(root.path().join("cmdline.txt")).unwrap();
        assert!(text.contains("root=PARTUUID=b8f2e6a1-02"));
        assert!(!text.contains("6c3d2f1a"));
    }

    #[test]
    fn rewrites_every_fstab_entry() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("etc")).unwrap();
        fs::write(
            root.path().join("etc/fstab"),
            "proc /proc proc defaults 0 0\n\
             PARTUUID=6c3d2f1a-01 /boot vfat defaults 0 2\n\
             PARTUUID=6c3d2f1a-02 / ext4 defaults,noatime 0 1\n",
        )
        .unwrap();

        rewrite_disk_id(root.path(), "6c3d2f1a", "b8f2e6a1").unwrap();
        let text = fs::read_to_string(root.path().join("etc/fstab")).unwrap();
        assert_eq!(text.matches("b8f2e6a1").count(), 2);
    }

    #[test]
    fn missing_files_are_not_an_error() {
        let root = tempfile::tempdir().unwrap();
        let changed = rewrite_disk_id(root.path(), "6c3d2f1a", "b8f2e6a1").unwrap();
        assert!(changed.is_empty());
    }
}
