//! Sequences a whole clone and owns its session.
//!
//! The orchestrator walks the stages below in order. Any failure ends the job
//! with the [`CloneError`] of the failing step after the session has been torn
//! down: mount points released, the virtual device detached. The partially
//! written image is kept for diagnosis.
//!
//! ```text
//! Init -> TableRead -> SizeEstimated -> Provisioned -> PartitionsBuilt
//!      -> ContentCopied -> FlagsSet -> Released -> (Compressed) -> Done
//! ```
use crate::build;
use crate::compress;
use crate::copy::{ContentCopier, CopyRequest};
use crate::device::partition_path;
use crate::error::{CloneError, MountStage, ToolError};
use crate::job::{CloneJob, Compression, Tuning};
use crate::partition::{self, PartitionDescriptor};
use crate::provision;
use crate::session::CloneSession;
use crate::size::{self, SizeEstimate};
use crate::tools::Host;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// A step of the clone pipeline, named after what has been completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    TableRead,
    SizeEstimated,
    Provisioned,
    PartitionsBuilt,
    ContentCopied,
    FlagsSet,
    Released,
    Compressed,
    Done,
}

/// Receives the engine's progress events. Every method has a no-op default.
pub trait CloneObserver {
    fn on_stage(&mut self, _stage: Stage) {}

    /// A partition copy begins; `index` counts data partitions from zero.
    fn on_copy_start(&mut self, _ordinal: u32, _index: usize, _count: usize) {}

    /// Percentage of the current partition copied, only in progress mode.
    fn on_copy_progress(&mut self, _ordinal: u32, _percent: u8) {}

    /// Bytes of the image compressed so far, out of `total`.
    fn on_compress_progress(&mut self, _done: u64, _total: u64) {}
}

impl CloneObserver for () {}

/// The outcome of a successful clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneReport {
    /// The raw image file.
    pub image: PathBuf,
    /// Where the result ended up; differs from `image` when compressed.
    pub output: PathBuf,
    pub size: SizeEstimate,
    /// Number of table entries recreated.
    pub partitions: usize,
    /// Disk identifier stamped on the destination, if any.
    pub disk_id: Option<String>,
    /// Set when the virtual device could not be released cleanly.
    pub detach_warning: Option<String>,
    pub stage: Stage,
}

/// Drives a [`CloneJob`] against a [`Host`].
pub struct CloneOrchestrator<'h, H: ?Sized> {
    host: &'h H,
    tuning: Tuning,
}

impl<'h, H: Host + ?Sized> CloneOrchestrator<'h, H> {
    pub fn new(host: &'h H) -> Self {
        CloneOrchestrator {
            host,
            tuning: Tuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Runs `job` to completion or to its first fatal error.
    pub fn run(
        &self,
        job: &CloneJob,
        observer: &mut dyn CloneObserver,
    ) -> Result<CloneReport, CloneError> {
        info!(
            "cloning {} to {}",
            job.source().display(),
            job.destination().display()
        );
        let mut session = CloneSession::start().map_err(|e| {
            let dir = std::env::temp_dir();
            CloneError::MountFailed {
                stage: MountStage::Estimate,
                device: dir.clone(),
                source: ToolError::io(dir, e),
            }
        })?;

        let mut stage = Stage::Init;
        let result = self.drive(job, &mut session, &mut stage, observer);
        if let Err(e) = &result {
            error!("clone failed after {stage:?}: {e}");
        }
        session.teardown(self.host);
        let mut report = result?;

        if job.compression() != Compression::None {
            if let Some(reason) = &report.detach_warning {
                warn!("not compressing, the image was not released cleanly: {reason}");
            } else {
                report.output =
                    compress::run(&report.image, job.compression(), |done, total| {
                        observer.on_compress_progress(done, total)
                    })?;
                enter(&mut stage, Stage::Compressed, observer);
            }
        }

        enter(&mut stage, Stage::Done, observer);
        report.stage = stage;
        Ok(report)
    }

    fn drive(
        &self,
        job: &CloneJob,
        session: &mut CloneSession,
        stage: &mut Stage,
        observer: &mut dyn CloneObserver,
    ) -> Result<CloneReport, CloneError> {
        let host = self.host;

        let parts = partition::read_table(host, job.source())?;
        enter(stage, Stage::TableRead, observer);

        if let Err(e) = host.refresh() {
            warn!("partprobe failed: {e}");
        }
        let size = size::estimate(
            host,
            job.source(),
            &parts,
            &mut session.source_mount,
            self.tuning.margin_percent,
            job.extra_space(),
        )?;
        enter(stage, Stage::SizeEstimated, observer);

        provision::check_destination(host, job.source(), job.destination(), size.required)?;
        provision::allocate(job.destination(), size.required)?;
        let device = provision::attach(host, job.destination(), size.required)?;
        session.device = Some(device.clone());
        enter(stage, Stage::Provisioned, observer);

        build::prepare_device(host, &device)?;
        let fresh_id = job.new_uuid().then_some(session.new_disk_id.as_str());
        session.resolved = build::run(host, job.source(), &device, &parts, fresh_id)?;
        enter(stage, Stage::PartitionsBuilt, observer);

        let copier = ContentCopier::new(host, &self.tuning, job.show_progress());
        let data: Vec<&PartitionDescriptor> = parts.iter().filter(|p| !p.is_extended()).collect();
        for (index, part) in data.iter().enumerate() {
            let ordinal = part.ordinal;
            info!("copying partition {} of {}", index + 1, data.len());
            observer.on_copy_start(ordinal, index, data.len());

            let from = partition_path(job.source(), ordinal);
            let to = partition_path(&device, ordinal);
            let old_id = session
                .resolved
                .get(&ordinal)
                .and_then(|meta| meta.disk_id.as_deref());
            let rewrite = old_id.zip(fresh_id);

            copier.copy(
                CopyRequest {
                    ordinal,
                    from: &from,
                    to: &to,
                    rewrite,
                },
                &mut session.source_mount,
                &mut session.destination_mount,
                &mut |percent| observer.on_copy_progress(ordinal, percent),
            )?;
        }
        enter(stage, Stage::ContentCopied, observer);

        for part in &parts {
            host.set_lba(&device, part.ordinal, part.flags.lba)
                .map_err(|source| CloneError::FlagSetFailed {
                    ordinal: part.ordinal,
                    lba: part.flags.lba,
                    source,
                })?;
        }
        enter(stage, Stage::FlagsSet, observer);

        session.device = None;
        let detach_warning = match host.detach(&device) {
            Ok(()) => None,
            Err(e) => {
                warn!("error releasing device {}: {e}", device.display());
                Some(e.to_string())
            }
        };
        enter(stage, Stage::Released, observer);

        let disk_id = fresh_id.map(str::to_string).or_else(|| {
            session
                .resolved
                .values()
                .find_map(|meta| meta.disk_id.clone())
        });
        Ok(CloneReport {
            image: job.destination().to_path_buf(),
            output: job.destination().to_path_buf(),
            size,
            partitions: parts.len(),
            disk_id,
            detach_warning,
            stage: *stage,
        })
    }
}

fn enter(stage: &mut Stage, next: Stage, observer: &mut dyn CloneObserver) {
    info!("stage {stage:?} -> {next:?}");
    *stage = next;
    observer.on_stage(next);
}
