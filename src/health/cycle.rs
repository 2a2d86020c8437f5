//! Periodic liveness cycle
//!
//! Due streams are drained in batches through a bounded worker pool. Results
//! of a batch are applied to the registry in one write. Cancellation is only
//! observed between batches; the soft deadline is checked as each probe is
//! about to start, and probes that never started are deferred with their
//! state untouched.

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::prober::StreamProbe;
use super::state::{HealthPolicy, ProbeOutcome, ProbeReport};
use crate::config::EngineConfig;
use crate::errors::{ProbeError, ResolverResult};
use crate::registry::{ChannelRegistry, ProbeTarget};

/// Counters for one health cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthCycleReport {
    /// Streams that were due when the cycle started
    pub due: usize,
    pub probed: usize,
    pub alive: usize,
    pub failed: usize,
    /// Streams that crossed the dead threshold in this cycle
    pub died: usize,
    pub recovered: usize,
    /// Due streams left for the next cycle (deadline or cancellation)
    pub deferred: usize,
    pub cancelled: bool,
    #[serde(with = "crate::config::duration_serde::duration")]
    pub duration: Duration,
}

/// Drives liveness probes for every due stream in the registry
pub struct HealthChecker {
    registry: Arc<ChannelRegistry>,
    probe: Arc<dyn StreamProbe>,
    config: EngineConfig,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        probe: Arc<dyn StreamProbe>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            probe,
            config,
        }
    }

    /// Run one cycle over the streams due now
    ///
    /// Fails only on invalid configuration, before any probe is sent.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> ResolverResult<HealthCycleReport> {
        self.config.validate()?;

        let started = Instant::now();
        let deadline = started + self.config.health_cycle_deadline;
        let policy = HealthPolicy::from_config(&self.config);
        let queue = self.registry.due_for_probe(Utc::now()).await;

        let mut report = HealthCycleReport {
            due: queue.len(),
            ..Default::default()
        };
        info!(
            "Starting health cycle: {} streams due (max concurrent: {})",
            report.due, self.config.max_concurrent_health_checks
        );

        let mut consumed = 0;
        for batch in queue.chunks(self.config.health_batch_size) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if Instant::now() >= deadline {
                break;
            }

            let results: Vec<Option<ProbeReport>> = futures::stream::iter(batch)
                .map(|target| async move {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    Some(self.probe_one(target).await)
                })
                .buffer_unordered(self.config.max_concurrent_health_checks)
                .collect()
                .await;
            consumed += batch.len();

            let reports: Vec<ProbeReport> = results.into_iter().flatten().collect();
            report.deferred += batch.len() - reports.len();
            report.probed += reports.len();
            report.alive += reports.iter().filter(|r| r.outcome.is_alive()).count();
            report.failed += reports.iter().filter(|r| !r.outcome.is_alive()).count();

            let transitions = self.registry.apply_probe_results(&reports, &policy).await;
            report.died += transitions.iter().filter(|t| t.died()).count();
            report.recovered += transitions.iter().filter(|t| t.recovered()).count();

            debug!(
                "Health batch done: {} probed, {} deferred so far",
                report.probed, report.deferred
            );
        }

        report.deferred += queue.len() - consumed;
        report.duration = started.elapsed();

        info!(
            "Health cycle finished in {:?}: {} probed, {} alive, {} failed, {} died, {} recovered, {} deferred{}",
            report.duration,
            report.probed,
            report.alive,
            report.failed,
            report.died,
            report.recovered,
            report.deferred,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }

    async fn probe_one(&self, target: &ProbeTarget) -> ProbeReport {
        let timeout = self.config.health_check_timeout;
        let outcome = match tokio::time::timeout(timeout, self.probe.probe(&target.stream_url)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::Failed {
                error: ProbeError::Timeout { timeout },
                response_time: Some(timeout),
            },
        };

        ProbeReport {
            stream_id: target.stream_id,
            outcome,
            checked_at: Utc::now(),
        }
    }
}
