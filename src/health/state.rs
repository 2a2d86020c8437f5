//! Liveness state machine and recovery schedule
//!
//! ```text
//! unknown --ok--> alive
//! unknown/alive/degraded --fail, below threshold--> degraded
//! any --fail, at/above threshold--> dead
//! dead --ok--> alive
//! ```

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BackoffConfig, EngineConfig};
use crate::errors::ProbeError;
use crate::models::{HealthState, StreamCandidate};
use crate::utils::UrlUtils;
use crate::utils::jitter::generate_jitter_percent;

/// What a single liveness probe observed
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Alive { status: u16, response_time: Duration },
    Failed { error: ProbeError, response_time: Option<Duration> },
}

impl ProbeOutcome {
    pub fn is_alive(&self) -> bool {
        matches!(self, ProbeOutcome::Alive { .. })
    }
}

/// A probe outcome tied to the stream it was taken for
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub stream_id: Uuid,
    pub outcome: ProbeOutcome,
    pub checked_at: DateTime<Utc>,
}

/// Thresholds and schedules applied to probe results
#[derive(Debug, Clone, PartialEq)]
pub struct HealthPolicy {
    pub failure_threshold_before_dead: u32,
    pub health_check_interval: Duration,
    pub recovery_backoff: BackoffConfig,
}

impl HealthPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            failure_threshold_before_dead: config.failure_threshold_before_dead,
            health_check_interval: config.health_check_interval,
            recovery_backoff: config.recovery_backoff.clone(),
        }
    }
}

/// State change produced by one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub stream_id: Uuid,
    pub from: HealthState,
    pub to: HealthState,
    pub consecutive_failures: u32,
}

impl HealthTransition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    pub fn died(&self) -> bool {
        self.to == HealthState::Dead && self.from != HealthState::Dead
    }

    pub fn recovered(&self) -> bool {
        self.from == HealthState::Dead && self.to == HealthState::Alive
    }
}

/// Apply one probe result to a stream
pub fn apply_probe(
    stream: &mut StreamCandidate,
    report: &ProbeReport,
    policy: &HealthPolicy,
) -> HealthTransition {
    let from = stream.health_state;
    let now = report.checked_at;
    stream.last_checked_at = Some(now);

    match &report.outcome {
        ProbeOutcome::Alive { response_time, .. } => {
            stream.consecutive_failures = 0;
            stream.health_state = HealthState::Alive;
            stream.last_response_time_ms = Some(response_time.as_millis() as u64);
            stream.last_error = None;
            stream.next_check_at = Some(add_duration(now, policy.health_check_interval));
        }
        ProbeOutcome::Failed {
            error,
            response_time,
        } => {
            stream.consecutive_failures = stream.consecutive_failures.saturating_add(1);
            stream.last_error = Some(error.to_string());
            if let Some(elapsed) = response_time {
                stream.last_response_time_ms = Some(elapsed.as_millis() as u64);
            }

            if stream.consecutive_failures >= policy.failure_threshold_before_dead {
                stream.health_state = HealthState::Dead;
                let overdue = stream.consecutive_failures - policy.failure_threshold_before_dead;
                let delay = recovery_delay_with_jitter(&policy.recovery_backoff, overdue);
                stream.next_check_at = Some(add_duration(now, delay));
            } else {
                stream.health_state = HealthState::Degraded;
                stream.next_check_at = Some(add_duration(now, policy.health_check_interval));
            }
        }
    }

    let transition = HealthTransition {
        stream_id: stream.id,
        from,
        to: stream.health_state,
        consecutive_failures: stream.consecutive_failures,
    };

    if transition.died() {
        warn!(
            "Stream {} ({}) marked dead after {} consecutive failures: {}",
            stream.id,
            UrlUtils::obfuscate_credentials(&stream.stream_url),
            stream.consecutive_failures,
            stream.last_error.as_deref().unwrap_or("unknown error")
        );
    } else if transition.recovered() {
        info!(
            "Stream {} ({}) recovered",
            stream.id,
            UrlUtils::obfuscate_credentials(&stream.stream_url)
        );
    } else if transition.changed() {
        debug!("Stream {} health {} -> {}", stream.id, from, transition.to);
    }

    transition
}

/// Delay before the next recovery probe of a dead stream, without jitter
///
/// `overdue` counts failures beyond the dead threshold, so the first recovery
/// probe is scheduled `initial_delay` after the stream died.
pub fn recovery_delay(backoff: &BackoffConfig, overdue: u32) -> Duration {
    let exponent = overdue.min(i32::MAX as u32) as i32;
    let delay_ms = backoff.initial_delay.as_millis() as f64 * backoff.multiplier.powi(exponent);
    let capped = delay_ms.min(backoff.max_delay.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

pub fn recovery_delay_with_jitter(backoff: &BackoffConfig, overdue: u32) -> Duration {
    let base = recovery_delay(backoff, overdue);
    let jitter = generate_jitter_percent(base.as_millis() as u64, backoff.jitter_percent);
    base + Duration::from_millis(jitter)
}

/// Whether the stream should be probed at `now`
pub fn is_due(stream: &StreamCandidate, now: DateTime<Utc>) -> bool {
    stream.next_check_at.is_none_or(|next| next <= now)
}

/// Diagnostic 0-100 health score from failures and last response time
pub fn health_score(consecutive_failures: u32, last_response_time_ms: Option<u64>) -> u8 {
    let mut score: i32 = 100;

    if consecutive_failures > 0 {
        score -= (consecutive_failures.saturating_mul(10)).min(50) as i32;
    }

    if let Some(ms) = last_response_time_ms {
        score -= match ms {
            ms if ms > 5000 => 30,
            ms if ms > 3000 => 20,
            ms if ms > 1000 => 10,
            _ => 0,
        };
    }

    score.clamp(0, 100) as u8
}

fn add_duration(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
