//! Capability interfaces for the external collaborators the engine drives.
//!
//! Each trait covers one tool family and speaks in structured arguments and
//! results. [`SystemHost`] implements all of them with the usual Linux
//! utilities; tests substitute in-memory fakes. The engine only ever needs the
//! combined [`Host`] bound.
mod command;
mod system;

pub use self::command::{Cmd, escape_shell_arg, quote_arg};
pub use self::system::SystemHost;

use crate::error::ToolError;
use crate::partition::{FsFormat, PartitionType};
use std::path::{Path, PathBuf};

/// Space accounting of a mounted file system, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsUsage {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

/// Where a recreated partition ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionEnd {
    /// The given last sector, inclusive.
    Sector(u64),
    /// The last sector of the device.
    DeviceEnd,
}

/// A partition to create on the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRequest {
    pub kind: PartitionType,
    /// File system tag passed through to the table, empty for none.
    pub filesystem: String,
    pub start: u64,
    pub end: PartitionEnd,
}

/// Query and modify msdos partition tables.
pub trait PartitionTool {
    /// The table listing of `device` in sector units.
    fn print(&self, device: &Path) -> Result<String, ToolError>;
    /// Zero the first sector of `device`.
    fn wipe(&self, device: &Path) -> Result<(), ToolError>;
    /// Write a fresh, empty msdos label.
    fn make_label(&self, device: &Path) -> Result<(), ToolError>;
    fn make_partition(&self, device: &Path, request: &PartitionRequest) -> Result<(), ToolError>;
    fn set_lba(&self, device: &Path, ordinal: u32, on: bool) -> Result<(), ToolError>;
    /// Write the 32-bit disk identifier (8 hex digits, no prefix).
    fn write_disk_id(&self, device: &Path, disk_id: &str) -> Result<(), ToolError>;
    /// Ask the kernel to re-read partition tables.
    fn refresh(&self) -> Result<(), ToolError>;
}

/// Read identifying metadata from block devices.
pub trait BlockProbe {
    fn filesystem_uuid(&self, partition: &Path) -> Result<Option<String>, ToolError>;
    fn filesystem_label(&self, partition: &Path) -> Result<Option<String>, ToolError>;
    /// The disk-level partition table identifier of `device`.
    fn disk_id(&self, device: &Path) -> Result<Option<String>, ToolError>;
}

/// Create file systems and set their labels.
pub trait Formatter {
    fn format(&self, format: FsFormat, partition: &Path, uuid: Option<&str>)
    -> Result<(), ToolError>;
    fn set_label(&self, format: FsFormat, partition: &Path, label: &str) -> Result<(), ToolError>;
}

pub trait Mounter {
    fn mount(&self, partition: &Path, target: &Path, read_only: bool) -> Result<(), ToolError>;
    fn unmount(&self, target: &Path) -> Result<(), ToolError>;
}

/// Expose image files as block devices.
pub trait LoopDevices {
    /// Attach `image` with partition scanning and return the new device node.
    fn attach(&self, image: &Path) -> Result<PathBuf, ToolError>;
    fn detach(&self, device: &Path) -> Result<(), ToolError>;
    /// The size of a block device in bytes.
    fn device_size(&self, device: &Path) -> Result<u64, ToolError>;
}

/// Recursive, attribute-preserving copy of one mounted tree into another.
pub trait TreeCopier {
    fn copy_tree(&self, from: &Path, to: &Path) -> Result<(), ToolError>;
}

/// File system usage and topology queries.
pub trait SpaceProbe {
    fn usage(&self, path: &Path) -> Result<FsUsage, ToolError>;
    /// The device node backing the file system that contains `path`.
    fn backing_device(&self, path: &Path) -> Result<Option<String>, ToolError>;
}

/// Every capability the clone engine needs.
///
/// `Sync` because the copy of a partition may run on a second thread.
pub trait Host:
    PartitionTool + BlockProbe + Formatter + Mounter + LoopDevices + TreeCopier + SpaceProbe + Sync
{
}

impl<T> Host for T where
    T: PartitionTool
        + BlockProbe
        + Formatter
        + Mounter
        + LoopDevices
        + TreeCopier
        + SpaceProbe
        + Sync
        + ?Sized
{
}
