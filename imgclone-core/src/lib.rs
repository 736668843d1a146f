//! The core, UI-agnostic clone engine of the `imgclone` utility.
//!
//! `imgclone-core` clones a live, partitioned SD card into a right-sized disk
//! image file. Rather than copying raw blocks it reproduces the source layout:
//! the msdos partition table is read, the image is sized to the data actually
//! present, and every partition is recreated, formatted with the source's
//! file system UUID and label, and filled by a file-level copy. The source is
//! only ever mounted read-only.
//!
//! The library is structured into several key modules:
//! - [`tools`]: capability traits for the external collaborators (partition
//!   tool, formatters, mounts, loop devices, copy, usage queries) and the
//!   [`tools::SystemHost`] adapter that implements them with Linux utilities.
//! - [`partition`]: partition descriptors and the table reader.
//! - [`size`], [`provision`], [`build`], [`copy`], [`rewrite`]: the individual
//!   pipeline steps.
//! - [`mod@clone`]: the [`CloneOrchestrator`] that sequences them.
//!
//! Progress is reported through the [`CloneObserver`] trait, so the calling
//! application can display it any way it chooses. Failures are a closed
//! [`CloneError`] enumeration that maps to a process exit code.
//!
//! ## Example: Cloning a card with progress reporting
//!
//! ```rust,no_run
//! use imgclone_core::{CloneJob, CloneObserver, CloneOrchestrator, Compression};
//! use imgclone_core::tools::SystemHost;
//!
//! struct Percent;
//!
//! impl CloneObserver for Percent {
//!     fn on_copy_progress(&mut self, ordinal: u32, percent: u8) {
//!         println!("partition {ordinal}: {percent}%");
//!     }
//! }
//!
//! let job = CloneJob::new(
//!     "/dev/mmcblk0",
//!     "/mnt/usb/backup.img",
//!     false,         // keep the source disk identifier
//!     10 * 1024 * 1024,
//!     true,          // report progress
//!     Compression::None,
//! )?;
//!
//! let host = SystemHost::new();
//! match CloneOrchestrator::new(&host).run(&job, &mut Percent) {
//!     Ok(report) => println!("wrote {}", report.output.display()),
//!     Err(e) => std::process::exit(e.exit_code().into()),
//! }
//! # Ok::<(), imgclone_core::job::JobError>(())
//! ```

pub mod build;
pub mod clone;
pub mod compress;
pub mod copy;
pub mod device;
pub mod error;
pub mod job;
pub mod partition;
pub mod platform;
pub mod provision;
pub mod rewrite;
pub mod session;
pub mod size;
pub mod tools;

pub use clone::{CloneObserver, CloneOrchestrator, CloneReport, Stage};
pub use error::{CloneError, ToolError};
pub use job::{CloneJob, Compression, Tuning};
