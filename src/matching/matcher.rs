//! Merge decisions for incoming streams
//!
//! The matcher works on snapshots handed to it by the registry and never
//! mutates anything itself. Stages run in order and the first one that
//! produces a channel wins:
//!
//! 1. exact canonical key
//! 2. fuzzy base-name ratio within the same region and variant
//! 3. logo hash distance within the same region and variant
//!
//! Names that only survived normalization through a fallback stage are limited
//! to the exact stage.

use futures::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use super::logo::LogoSimilarity;
use super::similarity::token_sort_ratio;
use crate::config::EngineConfig;
use crate::config::defaults::LOGO_HASH_BITS;
use crate::errors::{ResolverError, ResolverResult};
use crate::models::{CanonicalKey, CompiledMergeRule, MergeCandidate, MergeMethod, NormalizedIdentity};

/// What the matcher needs to know about an existing channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    pub id: Uuid,
    pub canonical_name: String,
    pub key: CanonicalKey,
    pub stream_count: usize,
    pub logo_url: Option<String>,
}

/// An incoming stream looking for a channel
#[derive(Debug, Clone, Copy)]
pub struct MatchRequest<'a> {
    pub identity: &'a NormalizedIdentity,
    pub raw_name: &'a str,
    pub logo_url: Option<&'a str>,
}

/// Result of running the matching stages
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    /// `None` when a new channel has to be created
    pub channel_id: Option<Uuid>,
    pub method: MergeMethod,
    pub confidence: f64,
    pub reason: String,
    pub candidates: Vec<MergeCandidate>,
}

impl MatchOutcome {
    fn no_match(reason: impl Into<String>) -> Self {
        Self {
            channel_id: None,
            method: MergeMethod::NoMatch,
            confidence: 0.0,
            reason: reason.into(),
            candidates: Vec::new(),
        }
    }
}

struct Scored<'s> {
    channel: &'s ChannelSnapshot,
    score: f64,
}

/// Decides which existing channel, if any, a stream belongs to
#[derive(Debug, Clone)]
pub struct ChannelMatcher {
    fuzzy_match_threshold: f64,
    enable_logo_matching: bool,
    logo_match_threshold: u32,
    /// Sorted by descending priority
    rules: Vec<CompiledMergeRule>,
}

impl ChannelMatcher {
    pub fn from_config(config: &EngineConfig) -> ResolverResult<Self> {
        let rules = config
            .merge_rules
            .iter()
            .map(|rule| rule.compile())
            .collect::<ResolverResult<Vec<_>>>()?;

        let mut matcher = Self {
            fuzzy_match_threshold: config.fuzzy_match_threshold,
            enable_logo_matching: config.enable_logo_matching,
            logo_match_threshold: config.logo_match_threshold,
            rules: Vec::new(),
        };
        matcher.set_rules(rules);
        Ok(matcher)
    }

    pub fn set_rules(&mut self, mut rules: Vec<CompiledMergeRule>) {
        rules.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
        self.rules = rules;
    }

    pub fn add_rule(&mut self, rule: CompiledMergeRule) {
        let mut rules = std::mem::take(&mut self.rules);
        rules.push(rule);
        self.set_rules(rules);
    }

    pub fn rules(&self) -> &[CompiledMergeRule] {
        &self.rules
    }

    /// Run every stage against the given snapshots
    ///
    /// `exact` holds enabled channels whose key equals the request's key;
    /// `group` holds enabled channels sharing its region and variant.
    pub async fn find_match(
        &self,
        request: MatchRequest<'_>,
        exact: &[ChannelSnapshot],
        group: &[ChannelSnapshot],
        logos: Option<&dyn LogoSimilarity>,
    ) -> MatchOutcome {
        if let Some(outcome) = self.exact_match(exact) {
            return outcome;
        }

        if request.identity.fallback {
            return MatchOutcome::no_match(
                "name only usable through normalization fallback; fuzzy and logo matching skipped",
            );
        }

        if let Some(outcome) = self.fuzzy_match(request, group) {
            return outcome;
        }

        if let Some(provider) = logos
            && let Some(outcome) = self.logo_match(request, group, provider).await
        {
            return outcome;
        }

        MatchOutcome::no_match(format!(
            "no channel matched '{}'",
            request.identity.key
        ))
    }

    /// Stage 1: identical canonical key
    ///
    /// Several channels can share a key only after manual corrections; the one
    /// with more streams wins, then the lexically smaller id.
    pub fn exact_match(&self, exact: &[ChannelSnapshot]) -> Option<MatchOutcome> {
        let winner = exact.iter().min_by(|a, b| {
            b.stream_count
                .cmp(&a.stream_count)
                .then_with(|| a.id.cmp(&b.id))
        })?;

        Some(MatchOutcome {
            channel_id: Some(winner.id),
            method: MergeMethod::Exact,
            confidence: 100.0,
            reason: format!("canonical key '{}' matched exactly", winner.key),
            candidates: exact.iter().map(|c| candidate(c, 100.0)).collect(),
        })
    }

    /// Stage 2: token-sort ratio of base names at or above the threshold
    pub fn fuzzy_match(
        &self,
        request: MatchRequest<'_>,
        group: &[ChannelSnapshot],
    ) -> Option<MatchOutcome> {
        let qualifying: Vec<Scored<'_>> = group
            .iter()
            .filter(|c| c.key.same_qualifiers(&request.identity.key))
            .filter(|c| !self.vetoed(request, c))
            .map(|c| Scored {
                channel: c,
                score: token_sort_ratio(request.identity.base_name(), &c.key.base_name),
            })
            .filter(|s| s.score >= self.fuzzy_match_threshold)
            .collect();

        self.pick(request, qualifying, MergeMethod::Fuzzy)
    }

    /// Stage 3: perceptual logo hash distance
    pub async fn logo_match(
        &self,
        request: MatchRequest<'_>,
        group: &[ChannelSnapshot],
        provider: &dyn LogoSimilarity,
    ) -> Option<MatchOutcome> {
        if !self.enable_logo_matching {
            return None;
        }
        let new_logo = request.logo_url?;

        let eligible: Vec<&ChannelSnapshot> = group
            .iter()
            .filter(|c| c.logo_url.is_some())
            .filter(|c| c.key.same_qualifiers(&request.identity.key))
            .filter(|c| !self.vetoed(request, c))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let new_hash = match provider.logo_hash(new_logo).await {
            Ok(hash) => hash,
            Err(e) => {
                debug!("Skipping logo matching for '{}': {}", request.raw_name, e);
                return None;
            }
        };

        let hashes = join_all(eligible.iter().map(|c| async move {
            let url = c.logo_url.as_deref().unwrap_or_default();
            (*c, provider.logo_hash(url).await.ok())
        }))
        .await;

        let qualifying: Vec<Scored<'_>> = hashes
            .into_iter()
            .filter_map(|(channel, hash)| {
                let distance = hash?.distance(&new_hash);
                (distance <= self.logo_match_threshold).then(|| Scored {
                    channel,
                    score: logo_confidence(distance),
                })
            })
            .collect();

        self.pick(request, qualifying, MergeMethod::Logo)
    }

    fn vetoed(&self, request: MatchRequest<'_>, channel: &ChannelSnapshot) -> bool {
        let rule = self.rules.iter().find(|rule| {
            rule.forbids(
                request.raw_name,
                request.identity.region(),
                &channel.canonical_name,
                channel.key.region,
            )
        });

        if let Some(rule) = rule {
            debug!(
                "Never-merge rule vetoed '{}' -> '{}'{}",
                request.raw_name,
                channel.canonical_name,
                rule.rule
                    .reason
                    .as_deref()
                    .map(|r| format!(" ({r})"))
                    .unwrap_or_default()
            );
            return true;
        }
        false
    }

    /// Best score, then more streams, then lexical canonical key
    fn pick(
        &self,
        request: MatchRequest<'_>,
        mut qualifying: Vec<Scored<'_>>,
        method: MergeMethod,
    ) -> Option<MatchOutcome> {
        qualifying.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.channel.stream_count.cmp(&a.channel.stream_count))
                .then_with(|| a.channel.key.to_string().cmp(&b.channel.key.to_string()))
                .then_with(|| a.channel.id.cmp(&b.channel.id))
        });
        let winner = qualifying.first()?;

        if qualifying.len() > 1 {
            let ambiguity = ResolverError::MergeAmbiguity {
                name: request.raw_name.to_string(),
                candidates: qualifying.len(),
            };
            warn!(
                "{} ({} match); choosing '{}': {}",
                ambiguity,
                method,
                winner.channel.canonical_name,
                qualifying
                    .iter()
                    .map(|s| format!("{}={:.1}", s.channel.key, s.score))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let reason = match method {
            MergeMethod::Logo => format!(
                "logo of '{}' within {} bits of '{}'",
                request.raw_name, self.logo_match_threshold, winner.channel.canonical_name
            ),
            _ => format!(
                "'{}' scored {:.1} against '{}' (threshold {:.1})",
                request.identity.base_name(),
                winner.score,
                winner.channel.key.base_name,
                self.fuzzy_match_threshold
            ),
        };

        Some(MatchOutcome {
            channel_id: Some(winner.channel.id),
            method,
            confidence: winner.score,
            reason,
            candidates: qualifying
                .iter()
                .map(|s| candidate(s.channel, s.score))
                .collect(),
        })
    }
}

fn candidate(channel: &ChannelSnapshot, score: f64) -> MergeCandidate {
    MergeCandidate {
        channel_id: channel.id,
        canonical_key: channel.key.to_string(),
        score,
        stream_count: channel.stream_count,
    }
}

/// 100 for identical hashes, falling linearly with the Hamming distance
pub fn logo_confidence(distance: u32) -> f64 {
    100.0 - (distance.min(LOGO_HASH_BITS) as f64 * 100.0 / LOGO_HASH_BITS as f64)
}
