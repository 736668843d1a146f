//! Copies the contents of one partition into its recreated counterpart.
//!
//! Source and destination partitions are mounted on the session's scratch
//! mount points, the destination is checked for room, and the tree is copied
//! with attributes preserved. With progress enabled the copy runs on a scoped
//! worker thread while the calling thread samples the destination's used space
//! and reports a percentage; the worker signals completion over a channel.
use crate::error::{CloneError, MountStage};
use crate::job::Tuning;
use crate::rewrite::rewrite_disk_id;
use crate::session::MountPoint;
use crate::tools::Host;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Progress of the copy of one partition, in bytes.
///
/// Shared between the copy worker and the sampling loop. Only the worker
/// toggles the copying flag; only the sampling loop records bytes.
#[derive(Debug)]
pub struct ProgressState {
    total: u64,
    done: AtomicU64,
    copying: AtomicBool,
}

impl ProgressState {
    pub fn new(total: u64) -> Self {
        ProgressState {
            total,
            done: AtomicU64::new(0),
            copying: AtomicBool::new(false),
        }
    }

    pub fn set_copying(&self, copying: bool) {
        self.copying.store(copying, Ordering::Release);
    }

    pub fn is_copying(&self) -> bool {
        self.copying.load(Ordering::Acquire)
    }

    pub fn record(&self, done: u64) {
        self.done.store(done, Ordering::Relaxed);
    }

    /// Marks every byte as copied.
    pub fn finish(&self) {
        self.done.fetch_max(self.total, Ordering::Relaxed);
    }

    /// `round(100 * done / total)`, clipped to `[0, 100]`.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let done = self.done.load(Ordering::Relaxed);
        let scaled = (done as u128 * 100 + self.total as u128 / 2) / self.total as u128;
        scaled.min(100) as u8
    }
}

/// How often to sample progress for a copy of `total` bytes.
///
/// Measured in KiB units: under 50 000 every second, under 500 000 every five
/// seconds, otherwise every ten.
pub fn poll_interval(total: u64) -> Duration {
    match total / 1024 {
        units if units < 50_000 => Duration::from_secs(1),
        units if units < 500_000 => Duration::from_secs(5),
        _ => Duration::from_secs(10),
    }
}

/// One partition to copy.
#[derive(Debug, Clone, Copy)]
pub struct CopyRequest<'p> {
    pub ordinal: u32,
    /// Source partition node.
    pub from: &'p Path,
    /// Destination partition node.
    pub to: &'p Path,
    /// Old and new disk identifier to patch into the copied boot files.
    pub rewrite: Option<(&'p str, &'p str)>,
}

/// Copies partitions one at a time through a pair of mount points.
pub struct ContentCopier<'a, H: ?Sized> {
    host: &'a H,
    tuning: &'a Tuning,
    show_progress: bool,
}

impl<'a, H: Host + ?Sized> ContentCopier<'a, H> {
    pub fn new(host: &'a H, tuning: &'a Tuning, show_progress: bool) -> Self {
        ContentCopier {
            host,
            tuning,
            show_progress,
        }
    }

    /// Mounts, copies, patches and unmounts one partition.
    ///
    /// The destination unmount is retried up to [`Tuning::unmount_attempts`]
    /// times before failing. The source unmount is best-effort.
    pub fn copy(
        &self,
        request: CopyRequest<'_>,
        source_mount: &mut MountPoint,
        destination_mount: &mut MountPoint,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<(), CloneError> {
        let ordinal = request.ordinal;
        if let Err(e) = self.host.refresh() {
            warn!("partprobe failed: {e}");
        }

        destination_mount
            .mount(self.host, request.to, false)
            .map_err(|source| CloneError::MountFailed {
                stage: MountStage::Destination,
                device: request.to.to_path_buf(),
                source,
            })?;
        source_mount
            .mount(self.host, request.from, true)
            .map_err(|source| CloneError::MountFailed {
                stage: MountStage::Source,
                device: request.from.to_path_buf(),
                source,
            })?;

        let failed = |source| CloneError::CopyFailed { ordinal, source };
        let used = self.host.usage(source_mount.path()).map_err(failed)?.used;
        let available = self
            .host
            .usage(destination_mount.path())
            .map_err(failed)?
            .available;
        if available <= used {
            return Err(CloneError::InsufficientSpace {
                ordinal,
                used,
                available,
            });
        }

        info!(
            "copying partition {ordinal}: {} -> {} ({used} bytes)",
            source_mount.path().display(),
            destination_mount.path().display()
        );
        if self.show_progress {
            self.copy_with_progress(
                ordinal,
                source_mount.path(),
                destination_mount.path(),
                used,
                on_progress,
            )?;
        } else {
            self.host
                .copy_tree(source_mount.path(), destination_mount.path())
                .map_err(failed)?;
        }

        if let Some((old, new)) = request.rewrite {
            rewrite_disk_id(destination_mount.path(), old, new)?;
        }

        self.unmount_destination(destination_mount)?;
        if let Err(e) = source_mount.unmount(self.host) {
            warn!("could not unmount source partition {ordinal}: {e}");
        }
        Ok(())
    }

    fn copy_with_progress(
        &self,
        ordinal: u32,
        from: &Path,
        to: &Path,
        total: u64,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<(), CloneError> {
        let interval = self.tuning.poll_interval.unwrap_or_else(|| poll_interval(total));
        let state = ProgressState::new(total);
        let host = self.host;
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let joined = thread::scope(|scope| {
            let shared = &state;
            let worker = scope.spawn(move || {
                shared.set_copying(true);
                let result = host.copy_tree(from, to);
                shared.set_copying(false);
                // The receiver only goes away once the scope is done with us.
                let _ = done_tx.send(());
                result
            });

            on_progress(state.percent());
            loop {
                match done_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) if state.is_copying() => match host.usage(to) {
                        Ok(usage) => {
                            state.record(usage.used);
                            on_progress(state.percent());
                        }
                        Err(e) => warn!("could not sample copy progress: {e}"),
                    },
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            worker.join()
        });

        let copied = joined.map_err(|_| CloneError::CopyTaskJoinFailed { ordinal })?;
        copied.map_err(|source| CloneError::CopyFailed { ordinal, source })?;
        state.finish();
        on_progress(state.percent());
        Ok(())
    }

    fn unmount_destination(&self, mount: &mut MountPoint) -> Result<(), CloneError> {
        let attempts = self.tuning.unmount_attempts.max(1);
        let mut attempt = 1;
        loop {
            match mount.unmount(self.host) {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= attempts => {
                    return Err(CloneError::UnmountFailed {
                        stage: MountStage::Destination,
                        mount_point: mount.path().to_path_buf(),
                        source,
                    });
                }
                Err(e) => {
                    warn!(
                        "could not unmount {} (attempt {attempt}/{attempts}): {e}",
                        mount.path().display()
                    );
                    thread::sleep(self.tuning.unmount_delay);
                    attempt += 1;
                }
            }
        }
    }
}
