//! Constants and tuning values for svcmgr.
//!
//! This module centralizes the timings and names used by the registry,
//! the probe, the supervisor and the refresh cycle.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Default registry file used when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "svcmgr.yaml";

/// Suffix appended to the registry path to form its advisory lock file.
pub const REGISTRY_LOCK_SUFFIX: &str = ".lock";

// ============================================================================
// Shell Execution Constants
// ============================================================================

/// Default shell used for executing service commands.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing command strings.
pub const SHELL_COMMAND_FLAG: &str = "-c";

/// Executable names treated as shells when collapsing `sh -c` wrappers.
pub const KNOWN_SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh"];

/// Prefix for the temp files that capture a launching service's output.
pub const OUTPUT_CAPTURE_PREFIX: &str = "svcmgr_";

/// Maximum number of bytes kept from each output stream for a launch error.
pub const MAX_OUTPUT_TAIL: usize = 300;

// ============================================================================
// Process Management Timing
// ============================================================================

/// How long a freshly launched command must stay alive to count as started.
pub const LAUNCH_GRACE: Duration = Duration::from_millis(800);

/// Interval between process liveness checks.
pub const PROCESS_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Time a service gets to exit after SIGTERM before it is killed.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a process gets to disappear after SIGKILL.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause between the stop and start halves of a restart.
pub const RESTART_PAUSE: Duration = Duration::from_millis(300);

// ============================================================================
// Refresh Cycle
// ============================================================================

/// Default interval between refresh ticks.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// Granularity at which a sleeping refresher checks for shutdown.
pub const REFRESH_SLEEP_STEP: Duration = Duration::from_millis(100);

/// Consecutive failed ticks after which a probe error is surfaced.
pub const PERSISTENT_PROBE_FAILURES: u32 = 3;

/// Timeout applied to helper utilities such as `lsof`.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(2);
