//! Provider sync passes
//!
//! A sync pass feeds one provider's batch through the registry in input order,
//! optionally measures new streams with the quality probe, then runs the
//! orphan sweep for that provider. Malformed entries are skipped with a
//! warning; they never abort the pass.

pub mod m3u;

use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::{ResolverError, ResolverResult};
use crate::models::{MergeMethod, QualitySource, RawChannelEntry};
use crate::quality::QualityProbe;
use crate::registry::ChannelRegistry;
use crate::utils::{UrlUtils, generate_stream_uuid};

pub use m3u::parse_m3u;

/// Counters for one provider sync pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub provider_id: String,
    pub entries: usize,
    pub resolved: usize,
    /// Streams the registry already knew; they keep their channel
    pub refreshed: usize,
    /// Entries rejected as malformed
    pub skipped: usize,
    pub channels_created: usize,
    pub exact_matches: usize,
    pub fuzzy_matches: usize,
    pub logo_matches: usize,
    pub quality_probed: usize,
    pub quality_failed: usize,
    /// Known streams absent from this pass
    pub missed: usize,
    /// Streams removed by the orphan sweep
    pub orphans_removed: usize,
    #[serde(with = "crate::config::duration_serde::duration")]
    pub duration: Duration,
}

/// Runs provider batches against a shared registry
pub struct SyncEngine {
    registry: Arc<ChannelRegistry>,
    quality_probe: Option<Arc<dyn QualityProbe>>,
    config: EngineConfig,
}

impl SyncEngine {
    pub fn new(registry: Arc<ChannelRegistry>, config: EngineConfig) -> Self {
        Self {
            registry,
            quality_probe: None,
            config,
        }
    }

    /// Used only when `enable_bitrate_analysis` is set
    pub fn with_quality_probe(mut self, probe: Arc<dyn QualityProbe>) -> Self {
        self.quality_probe = Some(probe);
        self
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Resolve every entry of one provider batch
    ///
    /// A cancelled pass stops between entries and skips the orphan sweep, so
    /// streams that were simply not reached are not counted as missing.
    pub async fn sync_provider(
        &self,
        provider_id: &str,
        entries: &[RawChannelEntry],
        cancel: &CancellationToken,
    ) -> ResolverResult<SyncReport> {
        self.config.validate()?;

        let started = Instant::now();
        let mut report = SyncReport {
            provider_id: provider_id.to_string(),
            entries: entries.len(),
            ..Default::default()
        };
        info!(
            "Starting sync for provider '{}': {} entries",
            provider_id,
            entries.len()
        );

        let mut seen: HashSet<Uuid> = HashSet::with_capacity(entries.len());
        let mut probe_candidates: Vec<Uuid> = Vec::new();

        for entry in entries {
            if cancel.is_cancelled() {
                warn!(
                    "Sync for provider '{}' cancelled after {} of {} entries",
                    provider_id,
                    report.resolved + report.skipped,
                    entries.len()
                );
                return Err(ResolverError::Cancelled {
                    operation: format!("sync of provider '{provider_id}'"),
                });
            }

            if entry.provider_id != provider_id {
                warn!(
                    "Skipping entry '{}' labelled with provider '{}' during sync of '{}'",
                    entry.raw_name, entry.provider_id, provider_id
                );
                report.skipped += 1;
                continue;
            }

            let previous_channel = self
                .registry
                .stream(generate_stream_uuid(&entry.provider_id, &entry.stream_url))
                .await
                .map(|s| s.channel_id);
            let (channel_id, decision) = match self.registry.resolve(entry).await {
                Ok(resolved) => resolved,
                Err(e @ ResolverError::MalformedEntry { .. }) => {
                    warn!("{}", e);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            report.resolved += 1;
            if !seen.insert(decision.stream_id) {
                debug!(
                    "Duplicate entry for {} in provider '{}' batch",
                    UrlUtils::obfuscate_credentials(&entry.stream_url),
                    provider_id
                );
                continue;
            }
            probe_candidates.push(decision.stream_id);
            if previous_channel == Some(channel_id) {
                report.refreshed += 1;
                continue;
            }
            match decision.method {
                MergeMethod::Exact => report.exact_matches += 1,
                MergeMethod::Fuzzy => report.fuzzy_matches += 1,
                MergeMethod::Logo => report.logo_matches += 1,
                MergeMethod::NoMatch => report.channels_created += 1,
                MergeMethod::Manual => {}
            }
        }

        if self.config.enable_bitrate_analysis
            && let Some(probe) = &self.quality_probe
        {
            self.measure_quality(probe.as_ref(), &probe_candidates, &mut report).await;
        }

        let sweep = self
            .registry
            .sweep_provider(provider_id, &seen, self.config.orphan_after_missed_syncs)
            .await;
        report.missed = sweep.missed;
        report.orphans_removed = sweep.removed.len();
        report.duration = started.elapsed();

        info!(
            "Sync for provider '{}' completed in {:?}: {} resolved ({} refreshed, {} exact, {} fuzzy, {} logo, {} new), {} skipped, {} missed, {} orphans removed",
            provider_id,
            report.duration,
            report.resolved,
            report.refreshed,
            report.exact_matches,
            report.fuzzy_matches,
            report.logo_matches,
            report.channels_created,
            report.skipped,
            report.missed,
            report.orphans_removed
        );
        Ok(report)
    }

    /// Probe streams that have no measured quality yet
    async fn measure_quality(
        &self,
        probe: &dyn QualityProbe,
        stream_ids: &[Uuid],
        report: &mut SyncReport,
    ) {
        let mut targets = Vec::new();
        for id in stream_ids {
            if let Some(stream) = self.registry.stream(*id).await
                && stream.quality.source != QualitySource::Probe
            {
                targets.push((stream.id, stream.stream_url));
            }
        }

        let results: Vec<_> = futures::stream::iter(targets)
            .map(|(id, url)| async move { (id, probe.probe(&url).await) })
            .buffer_unordered(self.config.max_concurrent_quality_probes.max(1))
            .collect()
            .await;

        for (stream_id, result) in results {
            match result {
                Ok(metrics) => match self.registry.apply_quality(stream_id, &metrics).await {
                    Ok(_) => report.quality_probed += 1,
                    Err(e) => debug!("Stream {} vanished before quality update: {}", stream_id, e),
                },
                Err(e) => {
                    debug!("Quality probe for stream {} failed: {}", stream_id, e);
                    report.quality_failed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ProbeError, ProbeResult};
    use crate::models::Resolution;
    use crate::quality::StreamMetrics;
    use async_trait::async_trait;
    use tracing_test::traced_test;

    struct FixedQuality;

    #[async_trait]
    impl QualityProbe for FixedQuality {
        async fn probe(&self, stream_url: &str) -> ProbeResult<StreamMetrics> {
            if stream_url.ends_with("broken.ts") {
                return Err(ProbeError::Analysis {
                    message: "no video stream reported".to_string(),
                });
            }
            Ok(StreamMetrics {
                width: Some(1920),
                height: Some(1080),
                bitrate_kbps: Some(6000),
                codec: Some("h264".to_string()),
                fps: Some(25.0),
            })
        }
    }

    fn engine(config: EngineConfig) -> SyncEngine {
        let registry = Arc::new(ChannelRegistry::new(&config).unwrap());
        SyncEngine::new(registry, config)
    }

    fn batch(provider: &str) -> Vec<RawChannelEntry> {
        vec![
            RawChannelEntry::new(provider, "CNN", format!("http://{provider}.example/cnn.ts")),
            RawChannelEntry::new(provider, "CNN HD", format!("http://{provider}.example/cnn-hd.ts")),
            RawChannelEntry::new(provider, "", format!("http://{provider}.example/blank.ts")),
            RawChannelEntry::new(provider, "BBC One", "ftp://nope"),
        ]
    }

    #[tokio::test]
    async fn test_sync_skips_malformed_entries() {
        let engine = engine(EngineConfig::default());
        let report = engine
            .sync_provider("p1", &batch("p1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.entries, 4);
        assert_eq!(report.resolved, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.channels_created, 1);
        assert_eq!(report.exact_matches, 1);
        assert_eq!(engine.registry().stats().await.channels, 1);

        let again = engine
            .sync_provider("p1", &batch("p1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.refreshed, 2);
        assert_eq!(again.channels_created, 0);
        assert_eq!(again.exact_matches, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_entries_are_logged() {
        let engine = engine(EngineConfig::default());
        engine
            .sync_provider("p1", &batch("p1"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(logs_contain("Malformed entry from provider 'p1'"));
        assert!(logs_contain("Sync for provider 'p1' completed"));
    }

    #[tokio::test]
    async fn test_foreign_entries_are_skipped() {
        let engine = engine(EngineConfig::default());
        let report = engine
            .sync_provider("p2", &batch("p1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.resolved, 0);
        assert_eq!(report.skipped, 4);
    }

    #[tokio::test]
    async fn test_cancelled_sync_does_not_sweep() {
        let engine = engine(EngineConfig {
            orphan_after_missed_syncs: 1,
            ..EngineConfig::default()
        });
        engine
            .sync_provider("p1", &batch("p1"), &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine
            .sync_provider("p1", &batch("p1"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::Cancelled { .. }));
        assert_eq!(engine.registry().stats().await.streams, 2);
    }

    #[tokio::test]
    async fn test_orphans_removed_after_repeated_misses() {
        let engine = engine(EngineConfig {
            orphan_after_missed_syncs: 2,
            ..EngineConfig::default()
        });
        let cancel = CancellationToken::new();
        engine.sync_provider("p1", &batch("p1"), &cancel).await.unwrap();

        let shrunk = &batch("p1")[..1];
        let first = engine.sync_provider("p1", shrunk, &cancel).await.unwrap();
        assert_eq!((first.missed, first.orphans_removed), (1, 0));

        let second = engine.sync_provider("p1", shrunk, &cancel).await.unwrap();
        assert_eq!((second.missed, second.orphans_removed), (1, 1));
        assert_eq!(engine.registry().stats().await.streams, 1);
    }

    #[tokio::test]
    async fn test_quality_probe_applied_when_enabled() {
        let config = EngineConfig {
            enable_bitrate_analysis: true,
            ..EngineConfig::default()
        };
        let engine = engine(config).with_quality_probe(Arc::new(FixedQuality));
        let entries = vec![
            RawChannelEntry::new("p1", "CNN", "http://p1.example/cnn.ts"),
            RawChannelEntry::new("p1", "CNN", "http://p1.example/broken.ts"),
        ];

        let report = engine
            .sync_provider("p1", &entries, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.quality_probed, 1);
        assert_eq!(report.quality_failed, 1);

        let channel = engine.registry().channels().await.remove(0);
        let view = engine.registry().ranked_view(channel.id).await.unwrap();
        assert_eq!(view.streams[0].resolution, Resolution::Fhd1080);
        assert_eq!(view.streams[0].quality_score, 700 + 60);
        assert_eq!(view.quality_score, 760);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_sync() {
        let config = EngineConfig {
            fuzzy_match_threshold: 140.0,
            ..EngineConfig::default()
        };
        let registry = Arc::new(ChannelRegistry::new(&EngineConfig::default()).unwrap());
        let engine = SyncEngine::new(registry.clone(), config);

        let err = engine
            .sync_provider("p1", &batch("p1"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(registry.stats().await.streams, 0);
    }
}
