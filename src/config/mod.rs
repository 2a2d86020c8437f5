use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};

use crate::errors::{ResolverError, ResolverResult};
use crate::models::MergeRule;

pub mod defaults;
pub mod duration_serde;

use defaults::*;
use duration_serde::parse_default;

/// Engine configuration, validated once at the start of every cycle
///
/// A cycle that is handed an invalid configuration aborts before touching the
/// registry; see [`EngineConfig::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum token-sort ratio (0-100) for a fuzzy merge
    #[serde(default = "default_fuzzy_match_threshold")]
    pub fuzzy_match_threshold: f64,

    /// Whether logo perceptual hashes are compared when names do not match
    #[serde(default = "default_enable_logo_matching")]
    pub enable_logo_matching: bool,

    /// Maximum Hamming distance (0-64) between two logo hashes for a merge
    #[serde(default = "default_logo_match_threshold")]
    pub logo_match_threshold: u32,

    /// Treat resolution tokens (HD, FHD, 4K, SD) as identity variants instead
    /// of stripping them as quality noise
    #[serde(default = "default_quality_tokens_as_variants")]
    pub quality_tokens_as_variants: bool,

    #[serde(default = "default_logo_fetch_timeout", with = "duration_serde::duration")]
    pub logo_fetch_timeout: Duration,

    #[serde(default = "default_logo_cache_size")]
    pub logo_cache_size: usize,

    /// Per-probe liveness timeout
    #[serde(default = "default_health_check_timeout", with = "duration_serde::duration")]
    pub health_check_timeout: Duration,

    /// How often a live or degraded stream becomes due again
    #[serde(default = "default_health_check_interval", with = "duration_serde::duration")]
    pub health_check_interval: Duration,

    /// Soft deadline for a whole probing cycle
    #[serde(default = "default_health_cycle_deadline", with = "duration_serde::duration")]
    pub health_cycle_deadline: Duration,

    #[serde(default = "default_max_concurrent_health_checks")]
    pub max_concurrent_health_checks: usize,

    /// Probes per batch; cancellation is honoured between batches
    #[serde(default = "default_health_batch_size")]
    pub health_batch_size: usize,

    #[serde(default = "default_failure_threshold_before_dead")]
    pub failure_threshold_before_dead: u32,

    /// Bytes requested by the partial GET fallback
    #[serde(default = "default_partial_get_bytes")]
    pub partial_get_bytes: u64,

    #[serde(default)]
    pub recovery_backoff: BackoffConfig,

    /// Run ffprobe against streams to measure bitrate/codec/resolution
    #[serde(default = "default_enable_bitrate_analysis")]
    pub enable_bitrate_analysis: bool,

    #[serde(default = "default_ffprobe_command")]
    pub ffprobe_command: String,

    #[serde(default = "default_quality_probe_timeout", with = "duration_serde::duration")]
    pub quality_probe_timeout: Duration,

    #[serde(default = "default_max_concurrent_quality_probes")]
    pub max_concurrent_quality_probes: usize,

    /// Sync passes a stream may be missing from its provider before removal
    #[serde(default = "default_orphan_after_missed_syncs")]
    pub orphan_after_missed_syncs: u32,

    /// Never-merge rules seeded into the registry
    #[serde(default)]
    pub merge_rules: Vec<MergeRule>,
}

/// Exponential backoff schedule for probing dead streams
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    #[serde(default = "default_recovery_initial_delay", with = "duration_serde::duration")]
    pub initial_delay: Duration,
    #[serde(default = "default_recovery_max_delay", with = "duration_serde::duration")]
    pub max_delay: Duration,
    #[serde(default = "default_recovery_multiplier")]
    pub multiplier: f64,
    /// Extra random delay as a percentage of the computed delay
    #[serde(default = "default_recovery_jitter_percent")]
    pub jitter_percent: u8,
}

// Matching defaults
fn default_fuzzy_match_threshold() -> f64 {
    DEFAULT_FUZZY_MATCH_THRESHOLD
}

fn default_enable_logo_matching() -> bool {
    DEFAULT_ENABLE_LOGO_MATCHING
}

fn default_logo_match_threshold() -> u32 {
    DEFAULT_LOGO_MATCH_THRESHOLD
}

fn default_quality_tokens_as_variants() -> bool {
    DEFAULT_QUALITY_TOKENS_AS_VARIANTS
}

fn default_logo_fetch_timeout() -> Duration {
    parse_default(DEFAULT_LOGO_FETCH_TIMEOUT)
}

fn default_logo_cache_size() -> usize {
    DEFAULT_LOGO_CACHE_SIZE
}

// Health defaults
fn default_health_check_timeout() -> Duration {
    parse_default(DEFAULT_HEALTH_CHECK_TIMEOUT)
}

fn default_health_check_interval() -> Duration {
    parse_default(DEFAULT_HEALTH_CHECK_INTERVAL)
}

fn default_health_cycle_deadline() -> Duration {
    parse_default(DEFAULT_HEALTH_CYCLE_DEADLINE)
}

fn default_max_concurrent_health_checks() -> usize {
    DEFAULT_MAX_CONCURRENT_HEALTH_CHECKS
}

fn default_health_batch_size() -> usize {
    DEFAULT_HEALTH_BATCH_SIZE
}

fn default_failure_threshold_before_dead() -> u32 {
    DEFAULT_FAILURE_THRESHOLD_BEFORE_DEAD
}

fn default_partial_get_bytes() -> u64 {
    DEFAULT_PARTIAL_GET_BYTES
}

fn default_recovery_initial_delay() -> Duration {
    parse_default(DEFAULT_RECOVERY_INITIAL_DELAY)
}

fn default_recovery_max_delay() -> Duration {
    parse_default(DEFAULT_RECOVERY_MAX_DELAY)
}

fn default_recovery_multiplier() -> f64 {
    DEFAULT_RECOVERY_MULTIPLIER
}

fn default_recovery_jitter_percent() -> u8 {
    DEFAULT_RECOVERY_JITTER_PERCENT
}

// Quality defaults
fn default_enable_bitrate_analysis() -> bool {
    DEFAULT_ENABLE_BITRATE_ANALYSIS
}

fn default_ffprobe_command() -> String {
    DEFAULT_FFPROBE_COMMAND.to_string()
}

fn default_quality_probe_timeout() -> Duration {
    parse_default(DEFAULT_QUALITY_PROBE_TIMEOUT)
}

fn default_max_concurrent_quality_probes() -> usize {
    DEFAULT_MAX_CONCURRENT_QUALITY_PROBES
}

// Sync defaults
fn default_orphan_after_missed_syncs() -> u32 {
    DEFAULT_ORPHAN_AFTER_MISSED_SYNCS
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_recovery_initial_delay(),
            max_delay: default_recovery_max_delay(),
            multiplier: default_recovery_multiplier(),
            jitter_percent: default_recovery_jitter_percent(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fuzzy_match_threshold: default_fuzzy_match_threshold(),
            enable_logo_matching: default_enable_logo_matching(),
            logo_match_threshold: default_logo_match_threshold(),
            quality_tokens_as_variants: default_quality_tokens_as_variants(),
            logo_fetch_timeout: default_logo_fetch_timeout(),
            logo_cache_size: default_logo_cache_size(),
            health_check_timeout: default_health_check_timeout(),
            health_check_interval: default_health_check_interval(),
            health_cycle_deadline: default_health_cycle_deadline(),
            max_concurrent_health_checks: default_max_concurrent_health_checks(),
            health_batch_size: default_health_batch_size(),
            failure_threshold_before_dead: default_failure_threshold_before_dead(),
            partial_get_bytes: default_partial_get_bytes(),
            recovery_backoff: BackoffConfig::default(),
            enable_bitrate_analysis: default_enable_bitrate_analysis(),
            ffprobe_command: default_ffprobe_command(),
            quality_probe_timeout: default_quality_probe_timeout(),
            max_concurrent_quality_probes: default_max_concurrent_quality_probes(),
            orphan_after_missed_syncs: default_orphan_after_missed_syncs(),
            merge_rules: Vec::new(),
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> ResolverResult<()> {
        if self.initial_delay.is_zero() {
            return Err(ResolverError::configuration(
                "recovery_backoff.initial_delay must be greater than zero",
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(ResolverError::configuration(format!(
                "recovery_backoff.max_delay ({:?}) must not be shorter than initial_delay ({:?})",
                self.max_delay, self.initial_delay
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ResolverError::configuration(format!(
                "recovery_backoff.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.jitter_percent > 100 {
            return Err(ResolverError::configuration(format!(
                "recovery_backoff.jitter_percent must be 0-100, got {}",
                self.jitter_percent
            )));
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Validate every field; the first violation is returned
    pub fn validate(&self) -> ResolverResult<()> {
        if !self.fuzzy_match_threshold.is_finite()
            || !(0.0..=100.0).contains(&self.fuzzy_match_threshold)
        {
            return Err(ResolverError::configuration(format!(
                "fuzzy_match_threshold must be within 0-100, got {}",
                self.fuzzy_match_threshold
            )));
        }
        if self.logo_match_threshold > LOGO_HASH_BITS {
            return Err(ResolverError::configuration(format!(
                "logo_match_threshold must be within 0-{LOGO_HASH_BITS}, got {}",
                self.logo_match_threshold
            )));
        }
        if self.health_check_timeout.is_zero() {
            return Err(ResolverError::configuration(
                "health_check_timeout must be greater than zero",
            ));
        }
        if self.max_concurrent_health_checks == 0 {
            return Err(ResolverError::configuration(
                "max_concurrent_health_checks must be at least 1",
            ));
        }
        if self.health_batch_size == 0 {
            return Err(ResolverError::configuration(
                "health_batch_size must be at least 1",
            ));
        }
        if self.failure_threshold_before_dead == 0 {
            return Err(ResolverError::configuration(
                "failure_threshold_before_dead must be at least 1",
            ));
        }
        if self.enable_bitrate_analysis {
            if self.ffprobe_command.trim().is_empty() {
                return Err(ResolverError::configuration(
                    "ffprobe_command must be set when enable_bitrate_analysis is on",
                ));
            }
            if self.max_concurrent_quality_probes == 0 {
                return Err(ResolverError::configuration(
                    "max_concurrent_quality_probes must be at least 1",
                ));
            }
        }
        if self.orphan_after_missed_syncs == 0 {
            return Err(ResolverError::configuration(
                "orphan_after_missed_syncs must be at least 1",
            ));
        }
        self.recovery_backoff.validate()?;
        for rule in &self.merge_rules {
            rule.compile()?;
        }
        Ok(())
    }

    /// Load configuration from `CONFIG_FILE` (or `config.toml`)
    pub fn load() -> ResolverResult<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from_file(&config_file)
    }

    /// Layer defaults, the TOML file (when present) and `CHANNEL_RESOLVER_*`
    /// environment variables, then validate the result
    pub fn load_from_file(config_file: &str) -> ResolverResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if Path::new(config_file).exists() {
            figment = figment.merge(Toml::file(config_file));
            info!("Loading configuration from {}", config_file);
        } else {
            info!(
                "Config file {} not found, using defaults and environment",
                config_file
            );
        }

        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ResolverError::configuration(format!("Failed to load config: {e}")))?;

        config.validate()?;
        Ok(config)
    }
}
