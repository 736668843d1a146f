//! The Linux adapter: every capability backed by the standard utilities
//! (`parted`, `fdisk`, `lsblk`, `blkid`, `mkfs.fat`, `mkfs.ext4`, `fatlabel`,
//! `e2label`, `mount`, `umount`, `losetup`, `cp`, `partprobe`).
use super::{
    BlockProbe, Cmd, Formatter, FsUsage, LoopDevices, Mounter, PartitionEnd, PartitionRequest,
    PartitionTool, SpaceProbe, TreeCopier,
};
use crate::error::ToolError;
use crate::partition::{FsFormat, SECTOR_SIZE};
use crate::platform;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// The host's own tool chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl SystemHost {
    pub fn new() -> Self {
        SystemHost
    }
}

fn parted(device: &Path) -> Cmd {
    Cmd::new("parted").arg("-s").arg_path(device)
}

impl PartitionTool for SystemHost {
    fn print(&self, device: &Path) -> Result<String, ToolError> {
        parted(device).args(["unit", "s", "print"]).read()
    }

    fn wipe(&self, device: &Path) -> Result<(), ToolError> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(device)
            .map_err(|e| ToolError::io(device, e))?;
        file.write_all(&[0u8; SECTOR_SIZE as usize])
            .and_then(|_| file.sync_all())
            .map_err(|e| ToolError::io(device, e))
    }

    fn make_label(&self, device: &Path) -> Result<(), ToolError> {
        parted(device).args(["mklabel", "msdos"]).run().map(drop)
    }

    fn make_partition(&self, device: &Path, request: &PartitionRequest) -> Result<(), ToolError> {
        let end = match request.end {
            PartitionEnd::Sector(sector) => format!("{sector}s"),
            PartitionEnd::DeviceEnd => "-1s".to_string(),
        };
        let mut cmd = parted(device).args(["--", "mkpart", request.kind.as_str()]);
        if !request.filesystem.is_empty() {
            cmd = cmd.arg(&request.filesystem);
        }
        cmd.arg(format!("{}s", request.start)).arg(end).run().map(drop)
    }

    fn set_lba(&self, device: &Path, ordinal: u32, on: bool) -> Result<(), ToolError> {
        parted(device)
            .arg("set")
            .arg(ordinal.to_string())
            .arg("lba")
            .arg(if on { "on" } else { "off" })
            .run()
            .map(drop)
    }

    fn write_disk_id(&self, device: &Path, disk_id: &str) -> Result<(), ToolError> {
        // Expert menu: change disk identifier, return, write.
        Cmd::new("fdisk")
            .arg_path(device)
            .stdin(format!("x\ni\n0x{disk_id}\nr\nw\n"))
            .run()
            .map(drop)
    }

    fn refresh(&self) -> Result<(), ToolError> {
        Cmd::new("partprobe").run().map(drop)
    }
}

impl BlockProbe for SystemHost {
    fn filesystem_uuid(&self, partition: &Path) -> Result<Option<String>, ToolError> {
        Cmd::new("lsblk")
            .args(["-n", "-o", "UUID"])
            .arg_path(partition)
            .query_token()
    }

    fn filesystem_label(&self, partition: &Path) -> Result<Option<String>, ToolError> {
        Cmd::new("lsblk")
            .args(["-n", "-o", "LABEL"])
            .arg_path(partition)
            .query_line()
    }

    fn disk_id(&self, device: &Path) -> Result<Option<String>, ToolError> {
        Cmd::new("blkid")
            .args(["-s", "PTUUID", "-o", "value"])
            .arg_path(device)
            .query_token()
    }
}

impl Formatter for SystemHost {
    fn format(
        &self,
        format: FsFormat,
        partition: &Path,
        uuid: Option<&str>,
    ) -> Result<(), ToolError> {
        let cmd = match format {
            FsFormat::Fat32 => {
                let cmd = Cmd::new("mkfs.fat").args(["-F", "32"]);
                match uuid {
                    Some(id) => cmd.args(["-i", id]),
                    None => cmd,
                }
            }
            FsFormat::Ext4 => {
                let cmd = Cmd::new("mkfs.ext4").arg("-F");
                match uuid {
                    Some(id) => cmd.args(["-U", id]),
                    None => cmd,
                }
            }
        };
        cmd.arg_path(partition).run().map(drop)
    }

    fn set_label(&self, format: FsFormat, partition: &Path, label: &str) -> Result<(), ToolError> {
        let tool = match format {
            FsFormat::Fat32 => "fatlabel",
            FsFormat::Ext4 => "e2label",
        };
        Cmd::new(tool).arg_path(partition).arg(label).run().map(drop)
    }
}

impl Mounter for SystemHost {
    fn mount(&self, partition: &Path, target: &Path, read_only: bool) -> Result<(), ToolError> {
        let mut cmd = Cmd::new("mount");
        if read_only {
            cmd = cmd.args(["-o", "ro"]);
        }
        cmd.arg_path(partition).arg_path(target).run().map(drop)
    }

    fn unmount(&self, target: &Path) -> Result<(), ToolError> {
        Cmd::new("umount").arg_path(target).run().map(drop)
    }
}

impl LoopDevices for SystemHost {
    fn attach(&self, image: &Path) -> Result<PathBuf, ToolError> {
        let cmd = Cmd::new("losetup")
            .args(["--show", "--find", "--partscan"])
            .arg_path(image);
        cmd.query_token()?
            .map(PathBuf::from)
            .ok_or_else(|| ToolError::Unparsable {
                command: cmd.to_string(),
                detail: "no device node printed".into(),
            })
    }

    fn detach(&self, device: &Path) -> Result<(), ToolError> {
        Cmd::new("losetup").arg("-d").arg_path(device).run().map(drop)
    }

    fn device_size(&self, device: &Path) -> Result<u64, ToolError> {
        platform::block_device_size(device).map_err(|e| ToolError::io(device, e))
    }
}

impl TreeCopier for SystemHost {
    fn copy_tree(&self, from: &Path, to: &Path) -> Result<(), ToolError> {
        // -a keeps ownership, modes, timestamps, links and special files;
        // -x stays on the one file system.
        Cmd::new("cp")
            .args(["-ax", "--sparse=always"])
            .arg_path(&from.join("."))
            .arg_path(&to.join("."))
            .run()
            .map(drop)
    }
}

impl SpaceProbe for SystemHost {
    fn usage(&self, path: &Path) -> Result<FsUsage, ToolError> {
        platform::filesystem_usage(path).map_err(|e| ToolError::io(path, e))
    }

    fn backing_device(&self, path: &Path) -> Result<Option<String>, ToolError> {
        platform::backing_device(path).map_err(|e| ToolError::io(path, e))
    }
}
