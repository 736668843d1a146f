//! The clone job description and engine tuning.
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The card cloned when no source is given.
pub const DEFAULT_SOURCE: &str = "/dev/mmcblk0";

/// Extra free space added to the image by default (10 MiB).
pub const DEFAULT_EXTRA_SPACE: u64 = 512 * 20480;

/// How the finished image is compressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Bzip2,
    Gzip,
}

impl Compression {
    /// The suffix appended to the image file name.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Bzip2 => Some("bz2"),
            Compression::Gzip => Some("gz"),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => f.write_str("none"),
            Compression::Bzip2 => f.write_str("bzip2"),
            Compression::Gzip => f.write_str("gzip"),
        }
    }
}

/// Why a [`CloneJob`] was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("missing destination file")]
    MissingDestination,
    #[error("missing source device")]
    MissingSource,
    #[error("destination {0} is the source device itself")]
    DestinationIsSource(PathBuf),
}

/// A validated request to clone one device into one image file.
///
/// Fields are private so a job can only be obtained through
/// [`CloneJob::new`] and is immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneJob {
    source: PathBuf,
    destination: PathBuf,
    new_uuid: bool,
    extra_space: u64,
    show_progress: bool,
    compression: Compression,
}

impl CloneJob {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        new_uuid: bool,
        extra_space: u64,
        show_progress: bool,
        compression: Compression,
    ) -> Result<Self, JobError> {
        let source = source.into();
        let destination = destination.into();
        if source.as_os_str().is_empty() {
            return Err(JobError::MissingSource);
        }
        if destination.as_os_str().is_empty() {
            return Err(JobError::MissingDestination);
        }
        if destination == source {
            return Err(JobError::DestinationIsSource(destination));
        }
        Ok(CloneJob {
            source,
            destination,
            new_uuid,
            extra_space,
            show_progress,
            compression,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Whether the destination gets a fresh disk identifier.
    pub fn new_uuid(&self) -> bool {
        self.new_uuid
    }

    pub fn extra_space(&self) -> u64 {
        self.extra_space
    }

    pub fn show_progress(&self) -> bool {
        self.show_progress
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }
}

/// Retry bounds and cadences of the engine.
///
/// The defaults are the production values; tests shorten the delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuning {
    /// Safety margin on the last partition's used bytes, in percent.
    pub margin_percent: u64,
    pub unmount_attempts: u32,
    pub unmount_delay: Duration,
    /// Fixed progress poll interval, overriding the volume-scaled cadence.
    pub poll_interval: Option<Duration>,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            margin_percent: 2,
            unmount_attempts: 30,
            unmount_delay: Duration::from_secs(10),
            poll_interval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_destination() {
        let err = CloneJob::new(DEFAULT_SOURCE, "", false, 0, false, Compression::None);
        assert_eq!(err, Err(JobError::MissingDestination));
    }

    #[test]
    fn rejects_cloning_onto_the_source() {
        let err = CloneJob::new(
            "/dev/sda",
            "/dev/sda",
            false,
            0,
            false,
            Compression::None,
        );
        assert!(matches!(err, Err(JobError::DestinationIsSource(_))));
    }

    #[test]
    fn accepts_a_regular_job() {
        let job = CloneJob::new(
            DEFAULT_SOURCE,
            "/mnt/usb/pi.img",
            true,
            DEFAULT_EXTRA_SPACE,
            true,
            Compression::Gzip,
        )
        .unwrap();
        assert_eq!(job.source(), Path::new("/dev/mmcblk0"));
        assert!(job.new_uuid());
        assert_eq!(job.extra_space(), 10 * 1024 * 1024);
        assert_eq!(job.compression().extension(), Some("gz"));
    }
}
