/// Configuration default values
///
/// This module contains all the default values for engine configuration,
/// making them easily changeable in one central location.
// Matching defaults
pub const DEFAULT_FUZZY_MATCH_THRESHOLD: f64 = 85.0;
pub const DEFAULT_ENABLE_LOGO_MATCHING: bool = true;
pub const DEFAULT_LOGO_MATCH_THRESHOLD: u32 = 6;
pub const DEFAULT_QUALITY_TOKENS_AS_VARIANTS: bool = false;
pub const DEFAULT_LOGO_FETCH_TIMEOUT: &str = "10s";
pub const DEFAULT_LOGO_CACHE_SIZE: usize = 1024;

// Perceptual hash geometry (8x8 average hash)
pub const LOGO_HASH_BITS: u32 = 64;

// Health check defaults
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: &str = "10s";
pub const DEFAULT_HEALTH_CHECK_INTERVAL: &str = "30m";
pub const DEFAULT_HEALTH_CYCLE_DEADLINE: &str = "10m";
pub const DEFAULT_MAX_CONCURRENT_HEALTH_CHECKS: usize = 50;
pub const DEFAULT_HEALTH_BATCH_SIZE: usize = 500;
pub const DEFAULT_FAILURE_THRESHOLD_BEFORE_DEAD: u32 = 3;
pub const DEFAULT_PARTIAL_GET_BYTES: u64 = 2048;

// Recovery backoff for dead streams
pub const DEFAULT_RECOVERY_INITIAL_DELAY: &str = "5m";
pub const DEFAULT_RECOVERY_MAX_DELAY: &str = "6h";
pub const DEFAULT_RECOVERY_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_RECOVERY_JITTER_PERCENT: u8 = 10;

// Quality analysis defaults
pub const DEFAULT_ENABLE_BITRATE_ANALYSIS: bool = false;
pub const DEFAULT_FFPROBE_COMMAND: &str = "ffprobe";
pub const DEFAULT_QUALITY_PROBE_TIMEOUT: &str = "15s";
pub const DEFAULT_MAX_CONCURRENT_QUALITY_PROBES: usize = 2;

// Sync defaults
pub const DEFAULT_ORPHAN_AFTER_MISSED_SYNCS: u32 = 3;

// Environment
pub const ENV_PREFIX: &str = "CHANNEL_RESOLVER_";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
