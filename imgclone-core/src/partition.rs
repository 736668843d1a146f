//! Partition descriptors and the reader for the source's partition table.
//!
//! The table is obtained from the partition tool's sector-unit listing, e.g.:
//!
//! ```text
//! Model: SD SC16G (sd/mmc)
//! Disk /dev/mmcblk0: 31116288s
//! Sector size (logical/physical): 512B/512B
//! Partition Table: msdos
//! Disk Flags:
//!
//! Number  Start    End        Size       Type     File system  Flags
//!  1      8192s    532479s    524288s    primary  fat32        lba
//!  2      532480s  31116287s  30583808s  primary  ext4
//! ```
//!
//! Rows are sliced on the header's column offsets rather than split on
//! whitespace, because the file system and flags columns may be empty.
use crate::error::{CloneError, ToolError};
use crate::tools::PartitionTool;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Size of one addressable sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// The largest number of partitions a source may carry.
pub const MAX_PARTITIONS: usize = 9;

/// The only partition table scheme that can be cloned.
pub const SUPPORTED_TABLE: &str = "msdos";

/// The role of a partition in an msdos table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    Primary,
    Extended,
    Logical,
}

impl PartitionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionType::Primary => "primary",
            PartitionType::Extended => "extended",
            PartitionType::Logical => "logical",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(PartitionType::Primary),
            "extended" => Some(PartitionType::Extended),
            "logical" => Some(PartitionType::Logical),
            _ => None,
        }
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file system the engine knows how to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsFormat {
    Fat32,
    Ext4,
}

impl fmt::Display for FsFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsFormat::Fat32 => f.write_str("fat32"),
            FsFormat::Ext4 => f.write_str("ext4"),
        }
    }
}

/// Boot flags carried over to the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootFlags {
    pub lba: bool,
}

impl BootFlags {
    fn parse(s: &str) -> Self {
        BootFlags {
            lba: s.split(',').map(str::trim).any(|flag| flag == "lba"),
        }
    }
}

/// One row of the source partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    /// 1-based partition number, identical on source and destination.
    pub ordinal: u32,
    /// First sector.
    pub start: u64,
    /// Last sector, inclusive.
    pub end: u64,
    pub kind: PartitionType,
    /// File system tag as reported by the partition tool (may be empty).
    pub filesystem: String,
    pub flags: BootFlags,
}

impl PartitionDescriptor {
    pub fn is_extended(&self) -> bool {
        self.kind == PartitionType::Extended
    }

    /// The file system to create on the destination, if any.
    ///
    /// `fat*` tags are matched by prefix and `ext4` exactly; everything else
    /// (swap, unknown, extended containers) is left unformatted.
    pub fn format(&self) -> Option<FsFormat> {
        if self.is_extended() {
            None
        } else if self.filesystem.starts_with("fat") {
            Some(FsFormat::Fat32)
        } else if self.filesystem == "ext4" {
            Some(FsFormat::Ext4)
        } else {
            None
        }
    }

    pub fn start_bytes(&self) -> u64 {
        self.start * SECTOR_SIZE
    }
}

impl fmt::Display for PartitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partition {} start: {}s end: {}s type: {} fs: {} flags: {}",
            self.ordinal,
            self.start,
            self.end,
            self.kind,
            if self.filesystem.is_empty() {
                "-"
            } else {
                &self.filesystem
            },
            if self.flags.lba { "lba" } else { "-" },
        )
    }
}

/// Reads the partition table of `device` in on-disk order.
///
/// This is a read-only operation on the source.
///
/// # Errors
///
/// - [`CloneError::SourceUnreadable`] if the listing cannot be obtained or parsed.
/// - [`CloneError::UnsupportedTableFormat`] for anything other than msdos.
/// - [`CloneError::TooManyPartitions`] for more than [`MAX_PARTITIONS`] rows.
pub fn read_table<T: PartitionTool + ?Sized>(
    tool: &T,
    device: &Path,
) -> Result<Vec<PartitionDescriptor>, CloneError> {
    let unreadable = |source| CloneError::SourceUnreadable {
        device: device.to_path_buf(),
        source,
    };

    let listing = tool.print(device).map_err(unreadable)?;
    let parts = parse_listing(&listing).map_err(|e| match e {
        ListingError::Format(found) => CloneError::UnsupportedTableFormat { found },
        ListingError::TooMany(count) => CloneError::TooManyPartitions {
            count,
            max: MAX_PARTITIONS,
        },
        ListingError::Malformed(detail) => unreadable(ToolError::Unparsable {
            command: "parted print".into(),
            detail,
        }),
    })?;

    for part in &parts {
        info!("{part}");
    }
    Ok(parts)
}

#[derive(Debug, PartialEq, Eq)]
enum ListingError {
    Format(String),
    TooMany(usize),
    Malformed(String),
}

/// Column byte offsets taken from the listing's header line.
struct Columns {
    kind: usize,
    filesystem: usize,
    flags: usize,
}

impl Columns {
    fn from_header(line: &str) -> Option<Self> {
        Some(Columns {
            kind: line.find("Type")?,
            filesystem: line.find("File system")?,
            flags: line.find("Flags")?,
        })
    }
}

fn column(line: &str, from: usize, to: Option<usize>) -> &str {
    let len = line.len();
    let from = from.min(len);
    let to = to.unwrap_or(len).min(len).max(from);
    line.get(from..to).map(str::trim).unwrap_or("")
}

fn sectors(token: &str) -> Option<u64> {
    token.strip_suffix('s')?.parse().ok()
}

fn parse_listing(listing: &str) -> Result<Vec<PartitionDescriptor>, ListingError> {
    let table = listing
        .lines()
        .find_map(|l| l.trim().strip_prefix("Partition Table:"))
        .map(str::trim)
        .ok_or_else(|| ListingError::Malformed("no partition table line".into()))?;
    if table != SUPPORTED_TABLE {
        return Err(ListingError::Format(table.to_string()));
    }

    let mut lines = listing.lines().skip_while(|l| !l.starts_with("Number"));
    let columns = lines
        .next()
        .and_then(Columns::from_header)
        .ok_or_else(|| ListingError::Malformed("no column header".into()))?;

    let rows: Vec<&str> = lines.filter(|l| l.starts_with(' ')).collect();
    if rows.len() > MAX_PARTITIONS {
        return Err(ListingError::TooMany(rows.len()));
    }
    if rows.is_empty() {
        return Err(ListingError::Malformed("no partitions".into()));
    }

    rows.into_iter().map(|row| parse_row(row, &columns)).collect()
}

fn parse_row(row: &str, columns: &Columns) -> Result<PartitionDescriptor, ListingError> {
    let malformed = || ListingError::Malformed(format!("bad partition row: {}", row.trim()));
    debug!("partition row: {}", row.trim_end());

    let mut numbers = column(row, 0, Some(columns.kind)).split_whitespace();
    let ordinal = numbers
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(malformed)?;
    let start = numbers.next().and_then(sectors).ok_or_else(malformed)?;
    let end = numbers.next().and_then(sectors).ok_or_else(malformed)?;

    let kind = PartitionType::parse(column(row, columns.kind, Some(columns.filesystem)))
        .ok_or_else(malformed)?;
    let filesystem = column(row, columns.filesystem, Some(columns.flags)).to_string();
    let flags = BootFlags::parse(column(row, columns.flags, None));

    Ok(PartitionDescriptor {
        ordinal,
        start,
        end,
        kind,
        filesystem,
        flags,
    })
}
