//! Shared utilities for stackd.

/// Loopback port allocation.
pub mod discovery;
/// Filesystem abstraction used to validate executables.
pub mod fs;
/// Provider process supervision.
pub mod process;
