//! Provides platform-specific functionality.
//!
//! This module contains the host queries that are not cross-platform:
//! file system usage, the device backing a path, and block device sizes.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the implementation for
//! the target OS. Cloning relies on loop devices and the msdos tool chain, so
//! only Linux is provided.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
