//! Constants and tuning values for the supervisor.
//!
//! Every cadence and timeout used by the background loops lives here so the
//! defaults in [`crate::config::SupervisorSettings`] have a single source.

use std::time::Duration;

// ============================================================================
// Process names
// ============================================================================

/// Default name of the control-plane (bridge) process.
pub const CONTROL_PLANE_NAME: &str = "bridge";

/// Default name of the bot runtime process.
pub const BOT_RUNTIME_NAME: &str = "bot-runtime";

// ============================================================================
// Process lifecycle
// ============================================================================

/// How long `start` waits before checking whether the child already exited.
pub const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Time allowed for a graceful termination before escalating.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_millis(1500);

/// Time allowed for a forceful kill to be reaped.
pub const FORCEFUL_STOP_TIMEOUT: Duration = Duration::from_millis(1000);

/// Poll step used while waiting on a child to exit.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Watchdog liveness poll interval.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval of `wait_all_stopped`.
pub const WAIT_STOPPED_POLL: Duration = Duration::from_millis(200);

/// Upper bound for joining a background thread during shutdown.
pub const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Granularity at which sleeping loops re-check their stop flag.
pub const STOP_CHECK_STEP: Duration = Duration::from_millis(100);

/// Time to wait for leftover output of a child that exited during startup.
pub const EARLY_EXIT_OUTPUT_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Elevation
// ============================================================================

/// Upper bound on the elevated-execution facility returning.
pub const ELEVATED_LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts made to find an elevated process by name after launch.
pub const ELEVATED_PID_SCAN_ATTEMPTS: u32 = 5;

/// Delay between elevated PID scans.
pub const ELEVATED_PID_SCAN_INTERVAL: Duration = Duration::from_millis(200);

/// Windows `ERROR_ELEVATION_REQUIRED`.
pub const WINDOWS_ERROR_ELEVATION_REQUIRED: i32 = 740;

// ============================================================================
// Ports
// ============================================================================

/// First port probed for the control plane.
pub const DEFAULT_CONTROL_PLANE_PORT: u16 = 13000;

/// Consecutive ports probed before giving up.
pub const DEFAULT_PORT_ATTEMPTS: u32 = 1000;

/// Connect timeout for the "is something listening" probe.
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(50);

// ============================================================================
// Logs
// ============================================================================

/// Ring buffer capacity for captured lines.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Capacity of the handoff queue between readers and the consumer.
pub const DEFAULT_HANDOFF_CAPACITY: usize = 4096;

/// Tracing target used for captured child output.
pub const CHILD_LOG_TARGET: &str = "lillia::child";

// ============================================================================
// Control plane / discovery / sampling
// ============================================================================

/// Per-call timeout for control-plane RPCs.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Delay between discovery attempts.
pub const DISCOVERY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Identity lookups attempted before the discovery loop gives up on identity.
pub const IDENTITY_MAX_ATTEMPTS: u32 = 120;

/// CPU measurement window used right after the sampler cache was reset.
pub const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(50);

/// Cadence of resource sampling in the monitor driver.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(3);

/// Cadence of log draining in the monitor driver.
pub const LOG_DRAIN_INTERVAL: Duration = Duration::from_millis(200);

/// Bytes per mebibyte.
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
