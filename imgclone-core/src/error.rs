//! Error types for the clone engine.
//!
//! [`ToolError`] describes a single failed invocation of an external
//! collaborator. [`CloneError`] names the step of the clone that failed and
//! carries the underlying cause; it is converted to a process exit code only at
//! the front-end, through [`CloneError::exit_code`].
use crate::partition::{FsFormat, PartitionType};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A failure reported by an external tool or host query.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("could not start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected output from `{command}`: {detail}")]
    Unparsable { command: String, detail: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ToolError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ToolError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Where in the pipeline a mount or unmount happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStage {
    /// Measuring used space on the source's last partition.
    Estimate,
    /// Mounting the source partition to copy from it.
    Source,
    /// Mounting the destination partition to copy into it.
    Destination,
}

/// How a partition was being recreated when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// An extended container running to the end of the device.
    Extended,
    /// The last data partition, grown to the end of the device.
    ToEnd,
    /// A partition with the source's exact start and end sectors.
    Exact,
}

/// The failing step of a clone, with its cause.
#[derive(Debug, Error)]
pub enum CloneError {
    #[error("unable to read the partition table of {device}")]
    SourceUnreadable {
        device: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("unsupported partition table `{found}` on source, only msdos is handled")]
    UnsupportedTableFormat { found: String },

    #[error("too many partitions on source: {count} (at most {max})")]
    TooManyPartitions { count: usize, max: usize },

    #[error("could not mount {device} ({stage:?})")]
    MountFailed {
        stage: MountStage,
        device: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("could not unmount {mount_point} ({stage:?})")]
    UnmountFailed {
        stage: MountStage,
        mount_point: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("could not create destination file {path}")]
    ProvisionFailed {
        path: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error(
        "destination file {path} is located on the disk being cloned ({device}), it must be on external storage"
    )]
    DestinationOnSourceDisk { path: PathBuf, device: String },

    #[error(
        "not enough free space for the destination image: {available} bytes free, {required} bytes required"
    )]
    InsufficientDestinationSpace { available: u64, required: u64 },

    #[error("could not clear the partition table on {device}")]
    DeviceWipeFailed {
        device: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("could not write a new partition table on {device}")]
    TableCreateFailed {
        device: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("could not create {kind} partition {ordinal}")]
    PartitionCreateFailed {
        ordinal: u32,
        kind: PartitionType,
        span: SpanKind,
        #[source]
        source: ToolError,
    },

    #[error("could not create {format} file system on partition {ordinal}")]
    FilesystemCreateFailed {
        ordinal: u32,
        format: FsFormat,
        /// Whether the failure happened on the retry without the source UUID.
        retried: bool,
        #[source]
        source: ToolError,
    },

    #[error("could not write disk identifier {disk_id} to {device}")]
    DiskIdWriteFailed {
        device: PathBuf,
        disk_id: String,
        #[source]
        source: ToolError,
    },

    #[error("could not update the disk identifier in {path}")]
    UuidRewriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "insufficient space on destination partition {ordinal}: {available} bytes free, {used} bytes to copy"
    )]
    InsufficientSpace {
        ordinal: u32,
        used: u64,
        available: u64,
    },

    #[error("copying partition {ordinal} failed")]
    CopyFailed {
        ordinal: u32,
        #[source]
        source: ToolError,
    },

    #[error("the copy task for partition {ordinal} terminated abnormally")]
    CopyTaskJoinFailed { ordinal: u32 },

    #[error("could not set flags on partition {ordinal}")]
    FlagSetFailed {
        ordinal: u32,
        lba: bool,
        #[source]
        source: ToolError,
    },

    #[error("could not compress {path}")]
    CompressFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CloneError {
    /// The process exit code for this failure. `0` and `1` are reserved for
    /// success and argument errors.
    pub fn exit_code(&self) -> u8 {
        match self {
            CloneError::SourceUnreadable { .. } => 2,
            CloneError::UnsupportedTableFormat { .. } => 3,
            CloneError::TooManyPartitions { .. } => 4,
            CloneError::MountFailed { stage, .. } => match stage {
                MountStage::Estimate => 5,
                MountStage::Destination => 16,
                MountStage::Source => 17,
            },
            CloneError::UnmountFailed { stage, .. } => match stage {
                MountStage::Estimate => 6,
                MountStage::Destination | MountStage::Source => 19,
            },
            CloneError::DeviceWipeFailed { .. } => 7,
            CloneError::TableCreateFailed { .. } => 8,
            CloneError::PartitionCreateFailed { span, .. } => match span {
                SpanKind::Extended => 9,
                SpanKind::ToEnd => 10,
                SpanKind::Exact => 11,
            },
            CloneError::FilesystemCreateFailed {
                format, retried, ..
            } => match (format, retried) {
                (FsFormat::Fat32, true) => 12,
                (FsFormat::Fat32, false) => 13,
                (FsFormat::Ext4, true) => 14,
                (FsFormat::Ext4, false) => 15,
            },
            CloneError::InsufficientSpace { .. } => 18,
            CloneError::CopyFailed { .. } => 20,
            CloneError::FlagSetFailed { lba, .. } => {
                if *lba {
                    21
                } else {
                    22
                }
            }
            CloneError::ProvisionFailed { .. } => 23,
            CloneError::CompressFailed { .. } => 24,
            CloneError::DestinationOnSourceDisk { .. } => 25,
            CloneError::InsufficientDestinationSpace { .. } => 26,
            CloneError::DiskIdWriteFailed { .. } | CloneError::UuidRewriteFailed { .. } => 27,
            CloneError::CopyTaskJoinFailed { .. } => 28,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_failure() -> ToolError {
        ToolError::Failed {
            command: "parted".into(),
            status: "exit status: 1".into(),
            stderr: String::new(),
        }
    }

    #[test]
    fn exit_codes_stay_in_fatal_range() {
        let errors = [
            CloneError::TooManyPartitions { count: 10, max: 9 },
            CloneError::CopyTaskJoinFailed { ordinal: 2 },
            CloneError::InsufficientDestinationSpace {
                available: 1,
                required: 2,
            },
            CloneError::UnmountFailed {
                stage: MountStage::Destination,
                mount_point: "/tmp/x".into(),
                source: tool_failure(),
            },
        ];
        for e in &errors {
            assert!((2..=28).contains(&e.exit_code()), "{e}");
        }
    }

    #[test]
    fn filesystem_codes_distinguish_retry_and_format() {
        let code = |format, retried| {
            CloneError::FilesystemCreateFailed {
                ordinal: 1,
                format,
                retried,
                source: tool_failure(),
            }
            .exit_code()
        };
        assert_eq!(code(FsFormat::Fat32, true), 12);
        assert_eq!(code(FsFormat::Fat32, false), 13);
        assert_eq!(code(FsFormat::Ext4, true), 14);
        assert_eq!(code(FsFormat::Ext4, false), 15);
    }

    #[test]
    fn mount_codes_depend_on_stage() {
        let code = |stage| {
            CloneError::MountFailed {
                stage,
                device: "/dev/mmcblk0p2".into(),
                source: tool_failure(),
            }
            .exit_code()
        };
        assert_eq!(code(MountStage::Estimate), 5);
        assert_eq!(code(MountStage::Destination), 16);
        assert_eq!(code(MountStage::Source), 17);
    }
}
