//! Channel registry
//!
//! The registry owns every [`Channel`] and [`StreamCandidate`] and is the only
//! place they are mutated. All state sits behind one `RwLock`; every write
//! (merge, health update, quality update, manual correction) also recomputes
//! the affected channels' stream order before the lock is released, so readers
//! never observe a half-applied change.
//!
//! Resolving a new stream takes a per-bucket mutex keyed by canonical key
//! first. Two syncs racing to create the same channel are therefore
//! serialized, while unrelated buckets proceed in parallel.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::{ResolverError, ResolverResult};
use crate::health::state::{HealthPolicy, HealthTransition, ProbeReport, apply_probe, is_due};
use crate::matching::{ChannelMatcher, ChannelSnapshot, IdentityExtractor, LogoSimilarity, MatchRequest};
use crate::models::{
    CanonicalKey, Channel, ChannelView, HealthState, MergeDecision, MergeMethod, MergeRule,
    NormalizedIdentity, QualityInfo, RankedStream, RawChannelEntry, Region, StreamCandidate, Variant,
};
use crate::quality::{QualityAnalyzer, StreamMetrics};
use crate::ranking::rank_streams;
use crate::utils::{UrlUtils, generate_channel_uuid, generate_deterministic_uuid, generate_stream_uuid};

type Qualifiers = (Option<Region>, Option<Variant>);

/// What became of a known stream on re-sync
enum Known {
    Kept(Uuid, MergeDecision),
    Detached(StreamCandidate),
}

/// A stream that is due for a liveness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub stream_id: Uuid,
    pub stream_url: String,
}

/// Result of an orphan sweep for one provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Streams absent from this sync
    pub missed: usize,
    /// Streams removed because they were absent too many times in a row
    pub removed: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub channels: usize,
    pub enabled_channels: usize,
    pub streams: usize,
    pub dead_streams: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    channels: HashMap<Uuid, Channel>,
    streams: HashMap<Uuid, StreamCandidate>,
    by_key: HashMap<CanonicalKey, BTreeSet<Uuid>>,
    by_qualifiers: HashMap<Qualifiers, BTreeSet<Uuid>>,
    /// Merge audit trail per channel, oldest first
    decisions: HashMap<Uuid, Vec<MergeDecision>>,
    next_seq: u64,
}

impl RegistryState {
    fn snapshots(&self, ids: Option<&BTreeSet<Uuid>>) -> Vec<ChannelSnapshot> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.channels.get(id))
            .filter(|c| c.enabled)
            .map(|c| ChannelSnapshot {
                id: c.id,
                canonical_name: c.canonical_name.clone(),
                key: c.key.clone(),
                stream_count: c.stream_ids.len(),
                logo_url: c.logo_url.clone(),
            })
            .collect()
    }

    fn insert_channel(&mut self, channel: Channel) {
        self.by_key
            .entry(channel.key.clone())
            .or_default()
            .insert(channel.id);
        self.by_qualifiers
            .entry((channel.key.region, channel.key.variant))
            .or_default()
            .insert(channel.id);
        self.channels.insert(channel.id, channel);
    }

    fn remove_channel(&mut self, channel_id: Uuid) -> Option<Channel> {
        let channel = self.channels.remove(&channel_id)?;
        if let Some(ids) = self.by_key.get_mut(&channel.key) {
            ids.remove(&channel_id);
            if ids.is_empty() {
                self.by_key.remove(&channel.key);
            }
        }
        let qualifiers = (channel.key.region, channel.key.variant);
        if let Some(ids) = self.by_qualifiers.get_mut(&qualifiers) {
            ids.remove(&channel_id);
            if ids.is_empty() {
                self.by_qualifiers.remove(&qualifiers);
            }
        }
        Some(channel)
    }

    fn remove_stream(&mut self, stream_id: Uuid) -> Option<StreamCandidate> {
        let stream = self.streams.remove(&stream_id)?;
        if let Some(channel) = self.channels.get_mut(&stream.channel_id) {
            channel.stream_ids.retain(|id| *id != stream_id);
        }
        Some(stream)
    }

    /// Recompute stream order and gapless ranks for one channel
    fn rerank(&mut self, channel_id: Uuid) {
        let Some(channel) = self.channels.get(&channel_id) else {
            return;
        };
        let order = rank_streams(channel.stream_ids.iter().filter_map(|id| self.streams.get(id)));

        for (rank, id) in order.iter().enumerate() {
            if let Some(stream) = self.streams.get_mut(id) {
                stream.priority_rank = rank as u32;
            }
        }
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.stream_ids = order;
        }
    }

    /// First id derived from `base` that is not taken yet
    fn fresh_channel_id(&self, base: Uuid) -> Uuid {
        let mut id = base;
        let mut attempt: u32 = 0;
        while self.channels.contains_key(&id) {
            attempt += 1;
            id = generate_deterministic_uuid(&[&base, &attempt]);
        }
        id
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn view(&self, channel_id: Uuid, include_dead: bool) -> Option<ChannelView> {
        let channel = self.channels.get(&channel_id)?;
        let ordered: Vec<&StreamCandidate> = channel
            .stream_ids
            .iter()
            .filter_map(|id| self.streams.get(id))
            .collect();

        // active streams rank ahead of dead ones, so the head is the best on offer
        let quality_score = ordered.first().map(|s| s.quality_score()).unwrap_or(0);

        Some(ChannelView {
            channel_id: channel.id,
            canonical_name: channel.canonical_name.clone(),
            canonical_key: channel.key.to_string(),
            region: channel.key.region,
            variant: channel.key.variant,
            category: channel.category.clone(),
            epg_id: channel.epg_id.clone(),
            logo_url: channel.logo_url.clone(),
            enabled: channel.enabled,
            quality_score,
            streams: ordered
                .into_iter()
                .filter(|s| include_dead || s.health_state.is_active())
                .map(RankedStream::from)
                .collect(),
        })
    }

    fn last_decision(&self, channel_id: Uuid, stream_id: Uuid) -> Option<MergeDecision> {
        self.decisions
            .get(&channel_id)?
            .iter()
            .rev()
            .find(|d| d.stream_id == stream_id)
            .cloned()
    }

    fn record(&mut self, decision: MergeDecision) {
        self.decisions
            .entry(decision.matched_channel_id)
            .or_default()
            .push(decision);
    }
}

/// Shared registry of channels and their ranked streams
pub struct ChannelRegistry {
    state: RwLock<RegistryState>,
    buckets: Mutex<HashMap<CanonicalKey, Arc<Mutex<()>>>>,
    extractor: IdentityExtractor,
    matcher: RwLock<ChannelMatcher>,
    quality: QualityAnalyzer,
    logos: Option<Arc<dyn LogoSimilarity>>,
}

impl ChannelRegistry {
    pub fn new(config: &EngineConfig) -> ResolverResult<Self> {
        config.validate()?;
        Ok(Self {
            state: RwLock::new(RegistryState::default()),
            buckets: Mutex::new(HashMap::new()),
            extractor: IdentityExtractor::new(config.quality_tokens_as_variants),
            matcher: RwLock::new(ChannelMatcher::from_config(config)?),
            quality: QualityAnalyzer,
            logos: None,
        })
    }

    /// Enable the logo stage of matching
    pub fn with_logo_similarity(mut self, logos: Arc<dyn LogoSimilarity>) -> Self {
        self.logos = Some(logos);
        self
    }

    pub async fn add_merge_rule(&self, rule: MergeRule) -> ResolverResult<()> {
        let compiled = rule.compile()?;
        self.matcher.write().await.add_rule(compiled);
        Ok(())
    }

    /// Assign an incoming entry to a channel
    ///
    /// A `(provider_id, stream_url)` pair that is already known keeps its
    /// channel while its name still classifies to that channel's region and
    /// variant; only its name, logo, priority and quality are refreshed. A
    /// renamed stream whose qualifiers changed is detached and matched again,
    /// keeping its health history.
    pub async fn resolve(&self, entry: &RawChannelEntry) -> ResolverResult<(Uuid, MergeDecision)> {
        let stream_url = validate_entry(entry)?;
        let stream_id = generate_stream_uuid(&entry.provider_id, &stream_url);
        let identity = self.extractor.identify(&entry.raw_name);

        let mut carried = None;
        let known = self.state.read().await.streams.contains_key(&stream_id);
        if known {
            let mut state = self.state.write().await;
            match self.refresh_known(&mut state, stream_id, entry, &identity.key) {
                Some(Known::Kept(channel_id, decision)) => return Ok((channel_id, decision)),
                Some(Known::Detached(previous)) => carried = Some(previous),
                None => {}
            }
        }

        let bucket = self.bucket_lock(&identity.key).await;
        let resolved = {
            let _bucket_guard = bucket.lock().await;
            self.resolve_new(entry, stream_url, stream_id, &identity, carried)
                .await
        };
        self.release_bucket(&identity.key, bucket).await;
        resolved
    }

    /// Match and insert a stream the registry does not hold; the caller owns
    /// the bucket lock for `identity.key`
    async fn resolve_new(
        &self,
        entry: &RawChannelEntry,
        stream_url: String,
        stream_id: Uuid,
        identity: &NormalizedIdentity,
        carried: Option<StreamCandidate>,
    ) -> ResolverResult<(Uuid, MergeDecision)> {
        let (exact, group) = {
            let state = self.state.read().await;
            (
                state.snapshots(state.by_key.get(&identity.key)),
                state.snapshots(
                    state
                        .by_qualifiers
                        .get(&(identity.region(), identity.variant())),
                ),
            )
        };

        let request = MatchRequest {
            identity,
            raw_name: &entry.raw_name,
            logo_url: entry.logo_url.as_deref(),
        };
        let outcome = {
            let matcher = self.matcher.read().await;
            matcher
                .find_match(request, &exact, &group, self.logos.as_deref())
                .await
        };

        let mut state = self.state.write().await;
        match self.refresh_known(&mut state, stream_id, entry, &identity.key) {
            Some(Known::Kept(channel_id, decision)) => return Ok((channel_id, decision)),
            // a concurrent resolve of the same stream detached it first
            Some(Known::Detached(_)) | None => {}
        }

        let now = Utc::now();
        let target = outcome.channel_id.filter(|id| {
            state
                .channels
                .get(id)
                .is_some_and(|c| c.enabled && c.key.same_qualifiers(&identity.key))
        });

        let (channel_id, method, confidence, mut reason, candidates) = match target {
            Some(id) => (
                id,
                outcome.method,
                outcome.confidence,
                outcome.reason,
                outcome.candidates,
            ),
            None => {
                let reason = match outcome.channel_id {
                    Some(vanished) => format!(
                        "matched channel {vanished} changed before commit; created new channel"
                    ),
                    None => outcome.reason,
                };
                let id = state.fresh_channel_id(generate_channel_uuid(
                    &identity.key.to_string(),
                    &stream_id,
                ));
                state.insert_channel(Channel {
                    id,
                    canonical_name: identity.display_name.clone(),
                    key: identity.key.clone(),
                    category: entry.category.clone(),
                    epg_id: entry.epg_id.clone(),
                    logo_url: entry.logo_url.clone(),
                    enabled: true,
                    manual_override: false,
                    created_at: now,
                    stream_ids: Vec::new(),
                });
                info!(
                    "Created channel '{}' ({}) for provider {}",
                    identity.display_name, identity.key, entry.provider_id
                );
                (id, MergeMethod::NoMatch, 0.0, reason, outcome.candidates)
            }
        };

        let stream = match carried {
            Some(previous) => {
                reason = format!(
                    "re-resolved after rename from '{}': {reason}",
                    previous.original_name
                );
                StreamCandidate {
                    channel_id,
                    provider_priority: entry.provider_priority,
                    original_name: entry.raw_name.clone(),
                    logo_url: entry.logo_url.clone(),
                    quality: self
                        .quality
                        .rescore(&entry.raw_name, &stream_url, &previous.quality),
                    priority_rank: 0,
                    missed_syncs: 0,
                    ..previous
                }
            }
            None => StreamCandidate {
                id: stream_id,
                channel_id,
                provider_id: entry.provider_id.clone(),
                provider_priority: entry.provider_priority,
                stream_url: stream_url.clone(),
                original_name: entry.raw_name.clone(),
                logo_url: entry.logo_url.clone(),
                quality: self.quality.analyze(&entry.raw_name, &stream_url, None),
                health_state: HealthState::Unknown,
                consecutive_failures: 0,
                last_checked_at: None,
                next_check_at: None,
                last_response_time_ms: None,
                last_error: None,
                priority_rank: 0,
                insertion_seq: state.next_seq(),
                missed_syncs: 0,
                created_at: now,
            },
        };
        state.streams.insert(stream_id, stream);

        if let Some(channel) = state.channels.get_mut(&channel_id) {
            channel.stream_ids.push(stream_id);
            if channel.logo_url.is_none() {
                channel.logo_url = entry.logo_url.clone();
            }
            if channel.epg_id.is_none() {
                channel.epg_id = entry.epg_id.clone();
            }
            if channel.category.is_none() {
                channel.category = entry.category.clone();
            }
        }
        state.rerank(channel_id);

        let decision = MergeDecision {
            stream_id,
            matched_channel_id: channel_id,
            method,
            confidence,
            reason,
            candidates,
            decided_at: now,
        };
        state.record(decision.clone());

        debug!(
            "Resolved '{}' ({}) -> channel {} via {} ({:.1})",
            entry.raw_name,
            UrlUtils::obfuscate_credentials(&stream_url),
            channel_id,
            decision.method,
            decision.confidence
        );

        Ok((channel_id, decision))
    }

    /// Refresh a known stream in place, or detach it from its channel when
    /// the new name no longer fits that channel's region and variant
    fn refresh_known(
        &self,
        state: &mut RegistryState,
        stream_id: Uuid,
        entry: &RawChannelEntry,
        key: &CanonicalKey,
    ) -> Option<Known> {
        let channel_id = state.streams.get(&stream_id)?.channel_id;
        let fits = state
            .channels
            .get(&channel_id)
            .is_some_and(|c| c.key.same_qualifiers(key));

        if !fits {
            let previous = state.remove_stream(stream_id)?;
            state.rerank(channel_id);
            info!(
                "Stream '{}' now classifies as {}; detaching it from channel {}",
                entry.raw_name, key, channel_id
            );
            return Some(Known::Detached(previous));
        }

        let stream = state.streams.get_mut(&stream_id)?;
        stream.original_name = entry.raw_name.clone();
        stream.logo_url = entry.logo_url.clone();
        stream.provider_priority = entry.provider_priority;
        stream.missed_syncs = 0;
        stream.quality = self
            .quality
            .rescore(&entry.raw_name, &stream.stream_url, &stream.quality);

        state.rerank(channel_id);

        let decision = state
            .last_decision(channel_id, stream_id)
            .unwrap_or_else(|| MergeDecision {
                stream_id,
                matched_channel_id: channel_id,
                method: MergeMethod::Exact,
                confidence: 100.0,
                reason: "known stream re-synced".to_string(),
                candidates: Vec::new(),
                decided_at: Utc::now(),
            });
        Some(Known::Kept(channel_id, decision))
    }

    async fn bucket_lock(&self, key: &CanonicalKey) -> Arc<Mutex<()>> {
        let mut buckets = self.buckets.lock().await;
        buckets.entry(key.clone()).or_default().clone()
    }

    /// Drop the bucket entry once no other resolve holds it
    async fn release_bucket(&self, key: &CanonicalKey, bucket: Arc<Mutex<()>>) {
        let mut buckets = self.buckets.lock().await;
        drop(bucket);
        if buckets.get(key).is_some_and(|b| Arc::strong_count(b) == 1) {
            buckets.remove(key);
        }
    }

    /// Move `stream_ids` out of a channel into a new manual channel
    ///
    /// The new channel keeps the source's region and variant. Its name
    /// defaults to the first moved stream's label.
    pub async fn split(
        &self,
        channel_id: Uuid,
        stream_ids: &[Uuid],
        new_name: Option<&str>,
    ) -> ResolverResult<Uuid> {
        if stream_ids.is_empty() {
            return Err(ResolverError::invalid_operation("no streams selected for split"));
        }

        let mut state = self.state.write().await;
        let source = state
            .channels
            .get(&channel_id)
            .cloned()
            .ok_or_else(|| ResolverError::not_found("channel", channel_id))?;

        let mut selected: Vec<Uuid> = stream_ids.to_vec();
        selected.sort();
        selected.dedup();
        if let Some(stray) = selected.iter().find(|id| !source.stream_ids.contains(id)) {
            return Err(ResolverError::invalid_operation(format!(
                "stream {stray} does not belong to channel {channel_id}"
            )));
        }

        let name = match new_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => source
                .stream_ids
                .iter()
                .find(|id| selected.contains(id))
                .and_then(|id| state.streams.get(id))
                .map(|s| self.extractor.identify(&s.original_name).display_name)
                .unwrap_or_else(|| format!("{} (Split)", source.canonical_name)),
        };
        let key = CanonicalKey::new(
            self.extractor.identify(&name).key.base_name,
            source.key.region,
            source.key.variant,
        );

        let seed = selected
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let new_id = state.fresh_channel_id(generate_deterministic_uuid(&[
            &"split",
            &channel_id,
            &seed,
        ]));

        let now = Utc::now();
        state.insert_channel(Channel {
            id: new_id,
            canonical_name: name.clone(),
            key,
            category: source.category.clone(),
            epg_id: None,
            logo_url: source.logo_url.clone(),
            enabled: true,
            manual_override: true,
            created_at: now,
            stream_ids: selected.clone(),
        });

        for id in &selected {
            if let Some(stream) = state.streams.get_mut(id) {
                stream.channel_id = new_id;
            }
            state.record(MergeDecision {
                stream_id: *id,
                matched_channel_id: new_id,
                method: MergeMethod::Manual,
                confidence: 100.0,
                reason: format!("split from '{}'", source.canonical_name),
                candidates: Vec::new(),
                decided_at: now,
            });
        }
        if let Some(channel) = state.channels.get_mut(&channel_id) {
            channel.stream_ids.retain(|id| !selected.contains(id));
            channel.manual_override = true;
        }
        state.rerank(channel_id);
        state.rerank(new_id);

        info!(
            "Split {} streams from '{}' into new channel '{}' ({})",
            selected.len(),
            source.canonical_name,
            name,
            new_id
        );
        Ok(new_id)
    }

    /// Move every stream of `source_id` into `target_id` and delete the source
    pub async fn merge_channels(&self, source_id: Uuid, target_id: Uuid) -> ResolverResult<usize> {
        if source_id == target_id {
            return Err(ResolverError::invalid_operation(
                "cannot merge a channel with itself",
            ));
        }

        let mut state = self.state.write().await;
        let source_key = state
            .channels
            .get(&source_id)
            .map(|c| c.key.clone())
            .ok_or_else(|| ResolverError::not_found("channel", source_id))?;
        let target_key = state
            .channels
            .get(&target_id)
            .map(|c| c.key.clone())
            .ok_or_else(|| ResolverError::not_found("channel", target_id))?;

        if !source_key.same_qualifiers(&target_key) {
            return Err(ResolverError::conflict(format!(
                "refusing to merge '{source_key}' into '{target_key}': region or variant differ"
            )));
        }

        let source = state
            .remove_channel(source_id)
            .ok_or_else(|| ResolverError::not_found("channel", source_id))?;
        let moved = source.stream_ids.clone();
        let now = Utc::now();

        for id in &moved {
            if let Some(stream) = state.streams.get_mut(id) {
                stream.channel_id = target_id;
            }
        }

        let history = state.decisions.remove(&source_id).unwrap_or_default();
        let trail = state.decisions.entry(target_id).or_default();
        trail.extend(history);
        trail.extend(moved.iter().map(|id| MergeDecision {
            stream_id: *id,
            matched_channel_id: target_id,
            method: MergeMethod::Manual,
            confidence: 100.0,
            reason: format!("manually merged from '{}'", source.canonical_name),
            candidates: Vec::new(),
            decided_at: now,
        }));

        if let Some(target) = state.channels.get_mut(&target_id) {
            target.stream_ids.extend(moved.iter().copied());
            target.manual_override = true;
            if target.logo_url.is_none() {
                target.logo_url = source.logo_url.clone();
            }
            if target.epg_id.is_none() {
                target.epg_id = source.epg_id.clone();
            }
        }
        state.rerank(target_id);

        info!(
            "Merged '{}' ({} streams) into channel {}",
            source.canonical_name,
            moved.len(),
            target_id
        );
        Ok(moved.len())
    }

    /// Disabled channels keep their streams but are never matched against
    pub async fn set_enabled(&self, channel_id: Uuid, enabled: bool) -> ResolverResult<()> {
        let mut state = self.state.write().await;
        let channel = state
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| ResolverError::not_found("channel", channel_id))?;
        channel.enabled = enabled;
        Ok(())
    }

    /// Every stream of the channel, active ones first
    pub async fn ranked_view(&self, channel_id: Uuid) -> ResolverResult<ChannelView> {
        self.state
            .read()
            .await
            .view(channel_id, true)
            .ok_or_else(|| ResolverError::not_found("channel", channel_id))
    }

    /// Only the streams worth trying; dead streams are left out
    pub async fn active_ranked_view(&self, channel_id: Uuid) -> ResolverResult<ChannelView> {
        self.state
            .read()
            .await
            .view(channel_id, false)
            .ok_or_else(|| ResolverError::not_found("channel", channel_id))
    }

    /// Full views of all channels, ordered by name
    pub async fn ranked_views(&self) -> Vec<ChannelView> {
        let state = self.state.read().await;
        let mut channels: Vec<&Channel> = state.channels.values().collect();
        channels.sort_by(|a, b| {
            a.canonical_name
                .cmp(&b.canonical_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        channels
            .into_iter()
            .filter_map(|c| state.view(c.id, true))
            .collect()
    }

    pub async fn primary_stream(&self, channel_id: Uuid) -> ResolverResult<Option<RankedStream>> {
        let view = self.active_ranked_view(channel_id).await?;
        Ok(view.streams.into_iter().next())
    }

    pub async fn decisions(&self, channel_id: Uuid) -> ResolverResult<Vec<MergeDecision>> {
        let state = self.state.read().await;
        if !state.channels.contains_key(&channel_id) {
            return Err(ResolverError::not_found("channel", channel_id));
        }
        Ok(state.decisions.get(&channel_id).cloned().unwrap_or_default())
    }

    pub async fn channels(&self) -> Vec<Channel> {
        let state = self.state.read().await;
        let mut channels: Vec<Channel> = state.channels.values().cloned().collect();
        channels.sort_by(|a, b| {
            a.canonical_name
                .cmp(&b.canonical_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        channels
    }

    pub async fn channel(&self, channel_id: Uuid) -> Option<Channel> {
        self.state.read().await.channels.get(&channel_id).cloned()
    }

    pub async fn stream(&self, stream_id: Uuid) -> Option<StreamCandidate> {
        self.state.read().await.streams.get(&stream_id).cloned()
    }

    pub async fn stats(&self) -> RegistryStats {
        let state = self.state.read().await;
        RegistryStats {
            channels: state.channels.len(),
            enabled_channels: state.channels.values().filter(|c| c.enabled).count(),
            streams: state.streams.len(),
            dead_streams: state
                .streams
                .values()
                .filter(|s| s.health_state == HealthState::Dead)
                .count(),
        }
    }

    /// Streams whose next check is due, oldest schedule first
    pub async fn due_for_probe(&self, now: DateTime<Utc>) -> Vec<ProbeTarget> {
        let state = self.state.read().await;
        let mut due: Vec<&StreamCandidate> =
            state.streams.values().filter(|s| is_due(s, now)).collect();
        due.sort_by(|a, b| {
            a.next_check_at
                .cmp(&b.next_check_at)
                .then_with(|| a.insertion_seq.cmp(&b.insertion_seq))
        });
        due.into_iter()
            .map(|s| ProbeTarget {
                stream_id: s.id,
                stream_url: s.stream_url.clone(),
            })
            .collect()
    }

    /// Apply a batch of probe results in one write and re-rank the channels
    /// they touched
    pub async fn apply_probe_results(
        &self,
        reports: &[ProbeReport],
        policy: &HealthPolicy,
    ) -> Vec<HealthTransition> {
        let mut state = self.state.write().await;
        let mut touched = BTreeSet::new();
        let mut transitions = Vec::with_capacity(reports.len());

        for report in reports {
            let Some(stream) = state.streams.get_mut(&report.stream_id) else {
                debug!(
                    "Dropping probe result for stream {} removed during the cycle",
                    report.stream_id
                );
                continue;
            };
            transitions.push(apply_probe(stream, report, policy));
            touched.insert(stream.channel_id);
        }

        for channel_id in touched {
            state.rerank(channel_id);
        }
        transitions
    }

    /// Record probe-measured quality for a stream and re-rank its channel
    pub async fn apply_quality(
        &self,
        stream_id: Uuid,
        metrics: &StreamMetrics,
    ) -> ResolverResult<QualityInfo> {
        let mut state = self.state.write().await;
        let stream = state
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| ResolverError::not_found("stream", stream_id))?;

        stream.quality = self
            .quality
            .analyze(&stream.original_name, &stream.stream_url, Some(metrics));
        let channel_id = stream.channel_id;
        let info = stream.quality.clone();

        state.rerank(channel_id);
        Ok(info)
    }

    /// Count a sync pass for `provider_id`, removing streams that have been
    /// missing for `orphan_after` consecutive passes
    ///
    /// Channels left without streams stay in place with quality zero.
    pub async fn sweep_provider(
        &self,
        provider_id: &str,
        seen: &HashSet<Uuid>,
        orphan_after: u32,
    ) -> SweepOutcome {
        let mut state = self.state.write().await;
        let mut outcome = SweepOutcome::default();
        let mut touched = BTreeSet::new();

        let provider_streams: Vec<Uuid> = state
            .streams
            .values()
            .filter(|s| s.provider_id == provider_id)
            .map(|s| s.id)
            .collect();

        for stream_id in provider_streams {
            let Some(stream) = state.streams.get_mut(&stream_id) else {
                continue;
            };
            if seen.contains(&stream_id) {
                stream.missed_syncs = 0;
                continue;
            }

            stream.missed_syncs += 1;
            outcome.missed += 1;
            if stream.missed_syncs < orphan_after {
                continue;
            }

            let channel_id = stream.channel_id;
            if let Some(removed) = state.remove_stream(stream_id) {
                debug!(
                    "Removed orphaned stream {} ({}) after {} missed syncs",
                    removed.id,
                    UrlUtils::obfuscate_credentials(&removed.stream_url),
                    removed.missed_syncs
                );
                touched.insert(channel_id);
                outcome.removed.push(stream_id);
            }
        }

        for channel_id in touched {
            state.rerank(channel_id);
        }
        outcome
    }
}

/// Reject entries that cannot be addressed; returns the trimmed stream URL
fn validate_entry(entry: &RawChannelEntry) -> ResolverResult<String> {
    if entry.provider_id.trim().is_empty() {
        return Err(ResolverError::malformed(
            entry.provider_id.clone(),
            "empty provider id",
        ));
    }
    if entry.raw_name.trim().is_empty() {
        return Err(ResolverError::malformed(
            entry.provider_id.clone(),
            format!(
                "blank channel name for {}",
                UrlUtils::obfuscate_credentials(&entry.stream_url)
            ),
        ));
    }
    UrlUtils::parse_stream_url(&entry.stream_url)
        .map_err(|message| ResolverError::malformed(entry.provider_id.clone(), message))?;

    Ok(entry.stream_url.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Resolution;

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(&EngineConfig::default()).unwrap()
    }

    fn entry(provider: &str, name: &str, url: &str) -> RawChannelEntry {
        RawChannelEntry::new(provider, name, url)
    }

    #[tokio::test]
    async fn test_resolve_creates_then_matches_exact() {
        let registry = registry();

        let (first, decision) = registry
            .resolve(&entry("p1", "CNN", "http://a.example/cnn.ts"))
            .await
            .unwrap();
        assert_eq!(decision.method, MergeMethod::NoMatch);

        let (second, decision) = registry
            .resolve(&entry("p2", "US: CNN HD", "http://b.example/cnn.ts"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(decision.method, MergeMethod::Exact);
        assert_eq!(decision.confidence, 100.0);

        let channel = registry.channel(first).await.unwrap();
        assert_eq!(channel.canonical_name, "CNN");
        assert_eq!(channel.stream_count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_entries_rejected() {
        let registry = registry();

        for bad in [
            entry("p1", "   ", "http://a.example/1.ts"),
            entry("p1", "CNN", "not a url"),
            entry("", "CNN", "http://a.example/1.ts"),
        ] {
            let err = registry.resolve(&bad).await.unwrap_err();
            assert!(matches!(err, ResolverError::MalformedEntry { .. }), "{err:?}");
        }
        assert_eq!(registry.stats().await.channels, 0);
    }

    #[tokio::test]
    async fn test_resync_keeps_channel_and_refreshes() {
        let registry = registry();
        let (channel, _) = registry
            .resolve(&entry("p1", "CNN", "http://a.example/cnn.ts"))
            .await
            .unwrap();

        let (again, decision) = registry
            .resolve(&entry("p1", "CNN 4K", "http://a.example/cnn.ts"))
            .await
            .unwrap();
        assert_eq!(channel, again);
        assert_eq!(decision.method, MergeMethod::NoMatch);

        let view = registry.ranked_view(channel).await.unwrap();
        assert_eq!(view.streams.len(), 1);
        assert_eq!(view.streams[0].resolution, Resolution::Uhd2160);
        assert_eq!(registry.decisions(channel).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resync_with_new_region_moves_stream() {
        let registry = registry();
        let (east, _) = registry
            .resolve(&entry("p1", "Sportsnet East", "http://a.example/sn-e.ts"))
            .await
            .unwrap();
        let (joined, first) = registry
            .resolve(&entry("p2", "Sportsnet East", "http://b.example/sn.ts"))
            .await
            .unwrap();
        assert_eq!(joined, east);

        let (moved, decision) = registry
            .resolve(&entry("p2", "Sportsnet West", "http://b.example/sn.ts"))
            .await
            .unwrap();
        assert_ne!(moved, east);
        assert_eq!(decision.stream_id, first.stream_id);
        assert_eq!(decision.method, MergeMethod::NoMatch);
        assert!(decision.reason.contains("Sportsnet East"), "{}", decision.reason);

        let west = registry.channel(moved).await.unwrap();
        assert_eq!(west.region(), Some(Region::West));
        assert_eq!(west.stream_ids, vec![first.stream_id]);
        assert_eq!(registry.channel(east).await.unwrap().stream_count(), 1);
        assert_eq!(registry.decisions(moved).await.unwrap().len(), 1);
        assert_eq!(registry.stats().await.streams, 2);
    }

    #[tokio::test]
    async fn test_moved_stream_keeps_health_history() {
        let registry = registry();
        let (_, first) = registry
            .resolve(&entry("p1", "ESPN", "http://a.example/espn.ts"))
            .await
            .unwrap();
        let policy = HealthPolicy::from_config(&EngineConfig::default());
        let report = ProbeReport {
            stream_id: first.stream_id,
            outcome: crate::health::ProbeOutcome::Alive {
                status: 200,
                response_time: std::time::Duration::from_millis(80),
            },
            checked_at: Utc::now(),
        };
        registry.apply_probe_results(&[report], &policy).await;

        registry
            .resolve(&entry("p1", "ESPN 2", "http://a.example/espn.ts"))
            .await
            .unwrap();

        let stream = registry.stream(first.stream_id).await.unwrap();
        assert_eq!(stream.original_name, "ESPN 2");
        assert_eq!(stream.health_state, HealthState::Alive);
        assert_eq!(stream.last_response_time_ms, Some(80));
        assert_eq!(registry.stats().await.channels, 2);
    }

    #[tokio::test]
    async fn test_bucket_locks_released_after_resolve() {
        let registry = registry();
        for (name, url) in [
            ("CNN", "http://a.example/cnn.ts"),
            ("BBC One", "http://a.example/bbc1.ts"),
            ("Sportsnet East", "http://a.example/sn-e.ts"),
        ] {
            registry.resolve(&entry("p1", name, url)).await.unwrap();
        }
        assert!(registry.buckets.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_split_and_merge_back() {
        let registry = registry();
        let (channel, _) = registry
            .resolve(&entry("p1", "Global", "http://a.example/global.ts"))
            .await
            .unwrap();
        let (_, decision) = registry
            .resolve(&entry("p2", "Global", "http://b.example/global.ts"))
            .await
            .unwrap();

        let new_channel = registry
            .split(channel, &[decision.stream_id], Some("Global BC"))
            .await
            .unwrap();
        assert_ne!(new_channel, channel);

        let split = registry.channel(new_channel).await.unwrap();
        assert!(split.manual_override);
        assert_eq!(split.stream_ids, vec![decision.stream_id]);
        assert_eq!(split.region(), None, "split keeps the source's region");
        assert_eq!(registry.channel(channel).await.unwrap().stream_count(), 1);

        let moved = registry.merge_channels(new_channel, channel).await.unwrap();
        assert_eq!(moved, 1);
        assert!(registry.channel(new_channel).await.is_none());
        assert_eq!(registry.channel(channel).await.unwrap().stream_count(), 2);

        let trail = registry.decisions(channel).await.unwrap();
        assert_eq!(trail.last().unwrap().method, MergeMethod::Manual);
    }

    #[tokio::test]
    async fn test_split_rejects_foreign_streams() {
        let registry = registry();
        let (channel, _) = registry
            .resolve(&entry("p1", "CNN", "http://a.example/cnn.ts"))
            .await
            .unwrap();

        let err = registry
            .split(channel, &[Uuid::from_u128(42)], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::InvalidOperation { .. }));

        let err = registry.split(channel, &[], None).await.unwrap_err();
        assert!(matches!(err, ResolverError::InvalidOperation { .. }));

        let err = registry
            .split(Uuid::from_u128(1), &[Uuid::from_u128(2)], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_merge_across_regions_is_conflict() {
        let registry = registry();
        let (east, _) = registry
            .resolve(&entry("p1", "Sportsnet East", "http://a.example/sn-e.ts"))
            .await
            .unwrap();
        let (west, _) = registry
            .resolve(&entry("p1", "Sportsnet West", "http://a.example/sn-w.ts"))
            .await
            .unwrap();

        let err = registry.merge_channels(east, west).await.unwrap_err();
        assert!(matches!(err, ResolverError::RegistryConflict { .. }));
        assert_eq!(registry.stats().await.channels, 2);
    }

    #[tokio::test]
    async fn test_disabled_channel_not_matched() {
        let registry = registry();
        let (channel, _) = registry
            .resolve(&entry("p1", "CNN", "http://a.example/cnn.ts"))
            .await
            .unwrap();
        registry.set_enabled(channel, false).await.unwrap();

        let (other, decision) = registry
            .resolve(&entry("p2", "CNN", "http://b.example/cnn.ts"))
            .await
            .unwrap();
        assert_ne!(channel, other);
        assert_eq!(decision.method, MergeMethod::NoMatch);
    }

    #[tokio::test]
    async fn test_orphan_sweep_removes_after_threshold() {
        let registry = registry();
        let (channel, kept) = registry
            .resolve(&entry("p1", "CNN", "http://a.example/cnn.ts"))
            .await
            .unwrap();
        let (_, gone) = registry
            .resolve(&entry("p1", "CNN HD", "http://a.example/cnn-hd.ts"))
            .await
            .unwrap();

        let seen = HashSet::from([kept.stream_id]);
        for pass in 1..=3 {
            let outcome = registry.sweep_provider("p1", &seen, 3).await;
            assert_eq!(outcome.missed, 1);
            assert_eq!(outcome.removed.is_empty(), pass < 3);
        }

        assert!(registry.stream(gone.stream_id).await.is_none());
        let view = registry.ranked_view(channel).await.unwrap();
        assert_eq!(view.streams.len(), 1);
        assert_eq!(view.streams[0].priority_rank, 0);
    }

    #[tokio::test]
    async fn test_empty_channel_has_zero_quality() {
        let registry = registry();
        let (channel, decision) = registry
            .resolve(&entry("p1", "CNN", "http://a.example/cnn.ts"))
            .await
            .unwrap();

        let outcome = registry.sweep_provider("p1", &HashSet::new(), 1).await;
        assert_eq!(outcome.removed, vec![decision.stream_id]);

        let view = registry.ranked_view(channel).await.unwrap();
        assert!(view.streams.is_empty());
        assert_eq!(view.quality_score, 0);
        assert!(registry.primary_stream(channel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_quality_reranks() {
        let registry = registry();
        let (channel, first) = registry
            .resolve(&entry("p1", "CNN", "http://a.example/cnn.ts"))
            .await
            .unwrap();
        let (_, second) = registry
            .resolve(&entry("p2", "CNN", "http://b.example/cnn.ts"))
            .await
            .unwrap();

        let primary = registry.primary_stream(channel).await.unwrap().unwrap();
        assert_eq!(primary.stream_id, first.stream_id);

        let metrics = StreamMetrics {
            height: Some(1080),
            ..Default::default()
        };
        let info = registry.apply_quality(second.stream_id, &metrics).await.unwrap();
        assert_eq!(info.quality_score, 700);

        let primary = registry.primary_stream(channel).await.unwrap().unwrap();
        assert_eq!(primary.stream_id, second.stream_id);
        assert_eq!(primary.priority_rank, 0);
    }
}
