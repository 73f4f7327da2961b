//! svcmgr supervises a small set of user-declared background services. It
//! keeps a registry of named shell commands, maps each one to the OS process
//! and TCP ports actually backing it, starts and stops those processes on
//! request, and reports port collisions and duplicate instances.

/// CLI interface.
pub mod cli;

/// Service registry.
pub mod config;

/// Conflict detection.
pub mod conflict;

/// Timings and names shared across modules.
pub mod constants;

/// Error handling.
pub mod error;

/// OS capabilities.
pub mod host;

/// Front-end facade.
pub mod manager;

/// Snapshots and the refresh cycle.
pub mod monitor;

/// Process table probing.
pub mod probe;

/// Terminal rendering.
pub mod status;

/// Service lifecycle state machine.
pub mod supervisor;

#[doc(hidden)]
pub mod test_utils;
