//! Central Configuration Constants
//!
//! Single source of truth for all tunable defaults. Values here are the
//! fallbacks used when the config file leaves a knob unset.

use std::time::Duration;

/// App name
pub const APP_NAME: &str = "NetWarden";

/// App version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default facade listen address (local-only by design)
pub const DEFAULT_API_LISTEN: &str = "127.0.0.1:7380";

/// Default state database filename (under the data dir)
pub const STATE_DB_FILE: &str = "netwarden.db";

/// Default backup directory name (under the data dir)
pub const BACKUP_DIR: &str = "backups";

/// Default feed cache directory name (under the data dir)
pub const FEED_CACHE_DIR: &str = "feed_cache";

/// Days a deployment backup is kept after commit
pub const DEFAULT_BACKUP_RETAIN_DAYS: i64 = 7;

/// Days of event rows kept in the store
pub const DEFAULT_STORE_RETAIN_DAYS: i64 = 30;

// ============================================================================
// DEPLOYMENT
// ============================================================================

/// Probation window before auto-commit / rollback decision
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval between reachability probes during probation
pub const HEARTBEAT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// How long an approval waits for the backend lock before failing
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-invocation timeout for backend subprocess calls
pub const ADAPTER_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Retry budget for transient adapter errors
pub const ADAPTER_RETRY_ATTEMPTS: u32 = 3;

/// Base backoff between transient-error retries
pub const ADAPTER_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Interval of the expired-rule sweep
pub const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// AUTONOMY
// ============================================================================

/// Widest CIDR an autonomous rule may target (IPv4 prefix length)
pub const DEFAULT_MAX_AUTONOMOUS_CIDR: u8 = 24;

/// Global ceiling on autonomous rule creation
pub const DEFAULT_AUTONOMY_RATE_PER_MIN: u32 = 10;

/// Circuit breaker: more than this many daemon-origin deployments ...
pub const DEFAULT_BREAKER_COUNT: u32 = 5;

/// ... inside this trailing window trips the breaker
pub const DEFAULT_BREAKER_WINDOW: Duration = Duration::from_secs(600);

/// Per-subject cooldown after an autonomous action
pub const SUBJECT_COOLDOWN: Duration = Duration::from_secs(600);

/// Block TTL per threat kind
pub const TTL_PORT_SCAN: Duration = Duration::from_secs(3600);
pub const TTL_BRUTE_FORCE: Duration = Duration::from_secs(86_400);
pub const TTL_RATE_ANOMALY: Duration = Duration::from_secs(7200);
pub const TTL_FEED_INDICATOR: Duration = Duration::from_secs(86_400);

// ============================================================================
// CORRELATOR
// ============================================================================

/// Sliding-window half life for decayed counts
pub const DECAY_HALF_LIFE: Duration = Duration::from_secs(60);

/// Auth failures within the window that make a brute-force assessment
pub const BRUTE_FORCE_THRESHOLD: u32 = 10;

/// Distinct destination ports within the window that make a scan assessment
pub const PORT_SCAN_THRESHOLD: u32 = 15;

/// Minimum spacing between assessments for one subject. Short on purpose:
/// the autonomy controller carries the long per-subject cooldown, and a
/// cautious operator wants re-assessment as evidence keeps piling up.
pub const REASSESS_INTERVAL: Duration = Duration::from_secs(10);

/// Events/second above which the correlator enters aggregation mode
pub const FLOOD_CEILING_EPS: f64 = 200.0;

/// Score a fast-path assessment must reach before escalation
pub const ESCALATION_SCORE: f64 = 0.8;

/// Scores in [SLOW_PATH_FLOOR, ESCALATION_SCORE) may consult the translator
pub const SLOW_PATH_FLOOR: f64 = 0.5;

// ============================================================================
// EVENT BUS / SOURCES
// ============================================================================

/// Default per-source queue budget
pub const DEFAULT_SOURCE_BUDGET: usize = 1024;

/// Window in which identical repeated log lines are coalesced
pub const COALESCE_WINDOW: Duration = Duration::from_secs(2);

/// Poll interval for file tails
pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Base / cap for crashed-task restart backoff
pub const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(60);

// ============================================================================
// EXTERNAL CALLS
// ============================================================================

/// Timeout for translator (inference endpoint) requests
pub const DEFAULT_TRANSLATOR_TIMEOUT: Duration = Duration::from_secs(20);

/// Timeout for a threat feed fetch
pub const FEED_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default feed poll interval
pub const DEFAULT_FEED_INTERVAL: Duration = Duration::from_secs(3600);
