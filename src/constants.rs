//! Crate-wide constants.
//!
//! Names of the on-disk layout, default locations and default timings.
//! The timings are only defaults; every one of them can be overridden
//! through [`crate::config::Config`].

use std::time::Duration;

// ============================================================================
// Directory layout
// ============================================================================

/// Folder under the user's home directory that the sync client replicates.
pub const DEFAULT_SYNC_FOLDER: &str = "Dropbox";

/// Subfolder of the synchronized folder that holds all endpoints.
pub const DEFAULT_SUBFOLDER: &str = "socks";

/// Name of an endpoint's inbox-signal directory.
pub const CONTROLS_DIR_NAME: &str = "controls";

/// Name of an endpoint's append-only outbox file.
pub const DATA_FILE_NAME: &str = "data";

/// Separator between the parts of a generated endpoint id.
pub const ID_SEPARATOR: char = '_';

// ============================================================================
// Environment
// ============================================================================

/// Environment variable that overrides the shared root.
pub const ROOT_ENV_VAR: &str = "FOLDERSOCK_ROOT";

// ============================================================================
// Timings
// ============================================================================

/// Interval between stat sweeps when the polling watch backend is used.
///
/// Sync clients usually write through temporary files and renames, which
/// some native backends report late or not at all. One second keeps the
/// sweep cheap while staying well below typical replication latency.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Interval of the monitor thread's safety rescan.
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_millis(2000);

/// How many times to re-check a peer path before giving up on it.
pub const DEFAULT_SETTLE_ATTEMPTS: u32 = 5;

/// First wait of the settle backoff; doubled on every attempt.
pub const DEFAULT_SETTLE_INITIAL_DELAY: Duration = Duration::from_millis(200);

/// Upper bound for a single settle wait.
pub const DEFAULT_SETTLE_MAX_DELAY: Duration = Duration::from_millis(2000);

// ============================================================================
// Limits
// ============================================================================

/// Payloads kept for an endpoint that has no receive callback yet. Later
/// payloads are dropped with a warning until one is registered.
pub const MAX_PENDING_MESSAGES: usize = 1024;
