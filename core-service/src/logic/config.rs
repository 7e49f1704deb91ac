//! Configuration
//!
//! One immutable snapshot loaded at startup (and rebuilt wholesale on
//! SIGHUP). Strict deserialization: an unknown key anywhere in the file is a
//! startup error, not a silent ignore. Defaults live in `constants`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::constants;
use crate::logic::autonomy::AutonomyLevel;
use crate::logic::deploy::{DeployTuning, ProbeMode};
use crate::logic::error::{CoreError, CoreResult};
use crate::logic::events::sources::Parser;
use crate::logic::intel::FeedSpec;

/// Environment variable overriding the config path.
pub const CONFIG_ENV: &str = "NETWARDEN_CONFIG";

/// Default config file location.
pub const CONFIG_PATH: &str = "/etc/netwarden/netwarden.toml";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub autonomy: AutonomyConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
    #[serde(default)]
    pub never_block: NeverBlockConfig,
    #[serde(default)]
    pub feeds: HashMap<String, FeedConfig>,
    #[serde(default)]
    pub translator: Option<TranslatorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { listen: default_listen() }
    }
}

fn default_listen() -> String {
    constants::DEFAULT_API_LISTEN.to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default = "default_backend")]
    pub name: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { name: default_backend(), options: HashMap::new() }
    }
}

fn default_backend() -> String {
    "nftables".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutonomyConfig {
    #[serde(default = "default_level")]
    pub level: AutonomyLevel,
    /// Widest v4 prefix an autonomous rule may target
    #[serde(default = "default_max_cidr")]
    pub max_cidr: u8,
    #[serde(default = "default_rate_per_min")]
    pub rate_per_min: u32,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            max_cidr: default_max_cidr(),
            rate_per_min: default_rate_per_min(),
            breaker: BreakerConfig::default(),
        }
    }
}

fn default_level() -> AutonomyLevel {
    AutonomyLevel::Monitor
}

fn default_max_cidr() -> u8 {
    constants::DEFAULT_MAX_AUTONOMOUS_CIDR
}

fn default_rate_per_min() -> u32 {
    constants::DEFAULT_AUTONOMY_RATE_PER_MIN
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_count")]
    pub count: u32,
    #[serde(default = "default_breaker_window")]
    pub window_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            count: default_breaker_count(),
            window_secs: default_breaker_window(),
        }
    }
}

fn default_breaker_count() -> u32 {
    constants::DEFAULT_BREAKER_COUNT
}

fn default_breaker_window() -> u64 {
    constants::DEFAULT_BREAKER_WINDOW.as_secs()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,
    /// `"disabled"`, or a table with liveness_target / require_inbound.
    /// Absent means required-but-unconfigured, which fails closed.
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_heartbeat_timeout(),
            probe: ProbeConfig::default(),
        }
    }
}

fn default_heartbeat_timeout() -> u64 {
    constants::DEFAULT_HEARTBEAT_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProbeConfig {
    /// The literal string "disabled"
    Word(String),
    Network {
        #[serde(default)]
        liveness_target: Option<String>,
        #[serde(default = "default_true")]
        require_inbound: bool,
    },
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig::Network { liveness_target: None, require_inbound: true }
    }
}

fn default_true() -> bool {
    true
}

impl ProbeConfig {
    pub fn to_mode(&self) -> CoreResult<ProbeMode> {
        match self {
            ProbeConfig::Word(word) if word == "disabled" => Ok(ProbeMode::Disabled),
            ProbeConfig::Word(other) => Err(CoreError::validation(format!(
                "deploy.heartbeat.probe: unknown value {:?}",
                other
            ))),
            ProbeConfig::Network { liveness_target, require_inbound } => Ok(ProbeMode::Network {
                liveness_target: liveness_target.clone(),
                require_inbound: *require_inbound,
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout")]
    pub timeout_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { timeout_secs: default_lock_timeout() }
    }
}

fn default_lock_timeout() -> u64 {
    constants::DEFAULT_LOCK_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_store_retain")]
    pub retain_days: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: None, retain_days: default_store_retain() }
    }
}

fn default_store_retain() -> i64 {
    constants::DEFAULT_STORE_RETAIN_DAYS
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_backup_retain")]
    pub retain_days: i64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { dir: None, retain_days: default_backup_retain() }
    }
}

fn default_backup_retain() -> i64 {
    constants::DEFAULT_BACKUP_RETAIN_DAYS
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub path: PathBuf,
    pub parser: Parser,
    #[serde(default = "default_budget")]
    pub budget: usize,
}

fn default_budget() -> usize {
    constants::DEFAULT_SOURCE_BUDGET
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NeverBlockConfig {
    #[serde(default)]
    pub entries: Vec<String>,
    #[serde(default = "default_true")]
    pub management_discovery: bool,
}

impl Default for NeverBlockConfig {
    fn default() -> Self {
        Self { entries: Vec::new(), management_discovery: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedConfig {
    pub url: String,
    #[serde(default = "default_feed_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_feed_age_max")]
    pub age_max_secs: u64,
}

fn default_feed_interval() -> u64 {
    constants::DEFAULT_FEED_INTERVAL.as_secs()
}

fn default_feed_age_max() -> u64 {
    constants::TTL_FEED_INDICATOR.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranslatorConfig {
    pub url: String,
    #[serde(default = "default_translator_timeout")]
    pub timeout_secs: u64,
}

fn default_translator_timeout() -> u64 {
    constants::DEFAULT_TRANSLATOR_TIMEOUT.as_secs()
}

// ============================================================================
// LOADING / DERIVED VALUES
// ============================================================================

impl Config {
    /// Load and strictly parse the file. A missing file yields the defaults
    /// (useful for first runs); a malformed or unknown-key file is an error.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("config {} missing, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(CoreError::validation(format!("config read: {}", e))),
        };
        toml::from_str(&text)
            .map_err(|e| CoreError::validation(format!("config parse: {}", e)))
    }

    pub fn config_path() -> PathBuf {
        std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(CONFIG_PATH))
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("netwarden")
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join(constants::STATE_DB_FILE))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup
            .dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join(constants::BACKUP_DIR))
    }

    pub fn feed_cache_dir(&self) -> PathBuf {
        Self::data_dir().join(constants::FEED_CACHE_DIR)
    }

    pub fn deploy_tuning(&self) -> DeployTuning {
        DeployTuning {
            lock_timeout: Duration::from_secs(self.deploy.lock.timeout_secs),
            heartbeat_timeout: Duration::from_secs(self.deploy.heartbeat.timeout_secs),
            probe_interval: constants::HEARTBEAT_PROBE_INTERVAL,
            backup_retain_days: self.backup.retain_days,
        }
    }

    pub fn breaker_window(&self) -> Duration {
        Duration::from_secs(self.autonomy.breaker.window_secs)
    }

    pub fn feed_specs(&self) -> Vec<FeedSpec> {
        self.feeds
            .iter()
            .map(|(name, feed)| FeedSpec {
                name: name.clone(),
                url: feed.url.clone(),
                interval: Duration::from_secs(feed.interval_secs),
                age_max: Duration::from_secs(feed.age_max_secs),
            })
            .collect()
    }
}
