use crate::error::{AppError, Result};

/// Redis list the scheduler pushes scan jobs onto and workers pop from.
pub const SCAN_QUEUE: &str = "scan_queue";

/// Redis list the workers push approved (signal, user) pairs onto.
pub const NOTIFY_QUEUE: &str = "notification_queue";

/// BRPOP timeout for both queues (seconds). Loops re-check shutdown between pops.
pub const QUEUE_POP_TIMEOUT_SECS: f64 = 5.0;

/// Scan jobs already queued beyond this depth mean the worker pool is behind;
/// the scheduler skips the bucket instead of stacking more work.
pub const SCAN_QUEUE_WATERMARK: usize = 512;

/// Provider fetch retry backoff in milliseconds, indexed by attempt.
pub const PROVIDER_BACKOFF_MS: &[u64] = &[500, 1_000, 2_000, 4_000];

/// Maximum provider fetch attempts per job before the job is dropped.
pub const FETCH_MAX_ATTEMPTS: usize = 4;

/// Cap on honoured Retry-After sleeps (seconds). Anything longer requeues the job.
pub const RETRY_AFTER_CAP_SECS: u64 = 30;

/// Messenger send retry backoff in milliseconds, indexed by attempt.
pub const MESSENGER_BACKOFF_MS: &[u64] = &[1_000, 2_000, 4_000];

/// Minimum FF increase over the last alerted value before re-alerting.
pub const DELTA_FF_MIN: f64 = 0.02;

/// Stability-tracker state TTL (seconds). Refreshed on every write so only
/// abandoned keys self-evict.
pub const STABILITY_TTL_SECS: u64 = 86_400;

/// Listed-expiry cache TTL (seconds); feeds the scheduler's high-tier rule.
pub const EXPIRY_CACHE_TTL_SECS: u64 = 86_400;

/// Per-record stability lock: lifetime, bounded acquisition retries, retry spacing.
pub const TRACKER_LOCK_TTL_MS: u64 = 2_000;
pub const TRACKER_LOCK_RETRIES: usize = 5;
pub const TRACKER_LOCK_BACKOFF_MS: u64 = 50;

/// Ceilings from the concurrency model: provider HTTP, cache op, messenger dispatch.
pub const PROVIDER_TIMEOUT_SECS: u64 = 10;
pub const CACHE_OP_TIMEOUT_MS: u64 = 1_000;
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;
pub const MESSENGER_TIMEOUT_SECS: u64 = 15;

/// How often the registry task recomputes subscriber counts and tiers (seconds).
pub const REGISTRY_REFRESH_SECS: u64 = 300;

/// A front target counts as "near a listed expiry" within this many days;
/// drives promotion to the high tier.
pub const HIGH_TIER_DTE_SLACK: i32 = 5;

/// Provider token bucket: steady-state requests per second and burst size.
pub const PROVIDER_RATE_PER_SEC: f64 = 4.0;
pub const PROVIDER_RATE_BURST: f64 = 8.0;

/// Capacity of each per-user notification dispatch channel.
pub const NOTIFY_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub polygon_api_key: String,
    pub telegram_bot_token: String,
    pub api_port: u16,
    pub log_level: String,
    /// Number of scan workers to spawn (WORKER_COUNT)
    pub worker_count: usize,
    /// Tier cadences in minutes (SCAN_CADENCE_HIGH / _MEDIUM / _LOW)
    pub cadence_high_mins: u64,
    pub cadence_medium_mins: u64,
    pub cadence_low_mins: u64,
    /// Fallbacks applied when a stored policy fails validation at load time.
    pub default_vol_point: String,
    pub default_timezone: String,
    pub default_ff_threshold: f64,
    pub default_sigma_fwd_floor: f64,
    pub default_min_open_interest: i32,
    pub default_min_volume: i32,
    pub default_max_bid_ask_pct: f64,
    pub default_stability_scans: i32,
    pub default_cooldown_minutes: i32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: require("DATABASE_URL")?,
            redis_url: require("REDIS_URL")?,
            polygon_api_key: require("POLYGON_API_KEY")?,
            telegram_bot_token: require("TELEGRAM_BOT_TOKEN")?,
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            worker_count: std::env::var("WORKER_COUNT")
                .unwrap_or_else(|_| "4".to_string())
                .parse::<usize>()
                .unwrap_or(4)
                .max(1),
            cadence_high_mins: env_u64("SCAN_CADENCE_HIGH", 3),
            cadence_medium_mins: env_u64("SCAN_CADENCE_MEDIUM", 15),
            cadence_low_mins: env_u64("SCAN_CADENCE_LOW", 60),
            default_vol_point: std::env::var("DEFAULT_VOL_POINT").unwrap_or_else(|_| "ATM".to_string()),
            default_timezone: std::env::var("DEFAULT_TIMEZONE")
                .unwrap_or_else(|_| "America/Vancouver".to_string()),
            default_ff_threshold: env_f64("DEFAULT_FF_THRESHOLD", 0.20),
            default_sigma_fwd_floor: env_f64("DEFAULT_SIGMA_FWD_FLOOR", 0.05),
            default_min_open_interest: env_u64("DEFAULT_MIN_OPEN_INTEREST", 100) as i32,
            default_min_volume: env_u64("DEFAULT_MIN_VOLUME", 10) as i32,
            default_max_bid_ask_pct: env_f64("DEFAULT_MAX_BID_ASK_PCT", 0.08),
            default_stability_scans: env_u64("DEFAULT_STABILITY_SCANS", 2) as i32,
            default_cooldown_minutes: env_u64("DEFAULT_COOLDOWN_MINUTES", 120) as i32,
        })
    }

    /// Cadence for a tier in seconds.
    pub fn cadence_secs(&self, tier: crate::types::Tier) -> i64 {
        let mins = match tier {
            crate::types::Tier::High => self.cadence_high_mins,
            crate::types::Tier::Medium => self.cadence_medium_mins,
            crate::types::Tier::Low => self.cadence_low_mins,
        };
        (mins * 60) as i64
    }
}

fn require(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| AppError::Config(format!("{name} must be set")))
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}
