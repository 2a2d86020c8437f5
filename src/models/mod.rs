//! Core data model: provider entries, channels, stream candidates and the
//! merge audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::health::health_score;

pub mod merge_rule;

pub use merge_rule::{CompiledMergeRule, MergeRule};

/// One channel entry as returned by a provider during a sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChannelEntry {
    pub provider_id: String,
    pub raw_name: String,
    pub stream_url: String,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub epg_id: Option<String>,
    /// Lower values are preferred when everything else ties
    #[serde(default)]
    pub provider_priority: i32,
}

impl RawChannelEntry {
    pub fn new<P: Into<String>, N: Into<String>, U: Into<String>>(
        provider_id: P,
        raw_name: N,
        stream_url: U,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            raw_name: raw_name.into(),
            stream_url: stream_url.into(),
            logo_url: None,
            category: None,
            epg_id: None,
            provider_priority: 0,
        }
    }

    pub fn with_logo<S: Into<String>>(mut self, logo_url: S) -> Self {
        self.logo_url = Some(logo_url.into());
        self
    }

    pub fn with_priority(mut self, provider_priority: i32) -> Self {
        self.provider_priority = provider_priority;
        self
    }

    pub fn with_category<S: Into<String>>(mut self, category: S) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Geographic qualifier that must never be merged across
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Region {
    East,
    West,
    North,
    South,
    Central,
    Pacific,
    Mountain,
    Atlantic,
    Ontario,
    Quebec,
    Alberta,
    #[strum(serialize = "bc")]
    #[serde(rename = "bc")]
    BritishColumbia,
    Prairies,
}

/// Edition qualifier that must never be merged across
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Plus,
    Premium,
    Extra,
    News,
    Sports,
    Movies,
    /// Trailing channel number, e.g. "TSN 2"
    Numbered(u16),
    Uhd,
    Fhd,
    Hd,
    Sd,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Plus => write!(f, "plus"),
            Variant::Premium => write!(f, "premium"),
            Variant::Extra => write!(f, "extra"),
            Variant::News => write!(f, "news"),
            Variant::Sports => write!(f, "sports"),
            Variant::Movies => write!(f, "movies"),
            Variant::Numbered(n) => write!(f, "{n}"),
            Variant::Uhd => write!(f, "uhd"),
            Variant::Fhd => write!(f, "fhd"),
            Variant::Hd => write!(f, "hd"),
            Variant::Sd => write!(f, "sd"),
        }
    }
}

/// Identity of a logical channel bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalKey {
    pub base_name: String,
    pub region: Option<Region>,
    pub variant: Option<Variant>,
}

impl CanonicalKey {
    pub fn new(base_name: impl Into<String>, region: Option<Region>, variant: Option<Variant>) -> Self {
        Self {
            base_name: base_name.into(),
            region,
            variant,
        }
    }

    /// Region and variant agree exactly; `None` only equals `None`
    pub fn same_qualifiers(&self, other: &CanonicalKey) -> bool {
        self.region == other.region && self.variant == other.variant
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let region = self.region.map(|r| r.to_string());
        let variant = self.variant.map(|v| v.to_string());
        write!(
            f,
            "{}|{}|{}",
            self.base_name,
            region.as_deref().unwrap_or("-"),
            variant.as_deref().unwrap_or("-")
        )
    }
}

/// Result of normalizing and classifying a raw channel label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedIdentity {
    pub key: CanonicalKey,
    /// Case-preserving label used when a new channel is created
    pub display_name: String,
    /// Name was garbage and only survived through the normalizer fallback
    pub fallback: bool,
}

impl NormalizedIdentity {
    pub fn base_name(&self) -> &str {
        &self.key.base_name
    }

    pub fn region(&self) -> Option<Region> {
        self.key.region
    }

    pub fn variant(&self) -> Option<Variant> {
        self.key.variant
    }
}

/// Liveness classification of a stream
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthState {
    #[default]
    Unknown,
    Alive,
    Degraded,
    Dead,
}

impl HealthState {
    /// Dead streams are kept but never offered as active
    pub fn is_active(&self) -> bool {
        !matches!(self, HealthState::Dead)
    }

    /// Position in the ranking tie-break (lower sorts first)
    pub fn rank_order(&self) -> u8 {
        match self {
            HealthState::Alive => 0,
            HealthState::Unknown => 1,
            HealthState::Degraded => 2,
            HealthState::Dead => 3,
        }
    }
}

/// Video resolution tier
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    #[default]
    #[strum(serialize = "unknown")]
    Unknown,
    #[strum(serialize = "SD")]
    Sd,
    #[strum(serialize = "720p")]
    Hd720,
    #[strum(serialize = "1080p")]
    Fhd1080,
    #[strum(serialize = "1440p")]
    Qhd1440,
    #[strum(serialize = "4K")]
    Uhd2160,
}

/// Where a stream's quality figures came from
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QualitySource {
    #[default]
    None,
    Name,
    Url,
    Probe,
}

/// Technical quality of one stream
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityInfo {
    pub resolution: Resolution,
    pub bitrate_kbps: Option<u32>,
    pub codec: Option<String>,
    pub fps: Option<f32>,
    pub quality_score: u32,
    pub source: QualitySource,
}

/// A logical channel owning one or more interchangeable streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub canonical_name: String,
    pub key: CanonicalKey,
    pub category: Option<String>,
    pub epg_id: Option<String>,
    pub logo_url: Option<String>,
    pub enabled: bool,
    /// Created or reshaped by a manual split/merge; exempt from key uniqueness
    pub manual_override: bool,
    pub created_at: DateTime<Utc>,
    /// Member streams in priority order
    pub stream_ids: Vec<Uuid>,
}

impl Channel {
    pub fn region(&self) -> Option<Region> {
        self.key.region
    }

    pub fn variant(&self) -> Option<Variant> {
        self.key.variant
    }

    pub fn stream_count(&self) -> usize {
        self.stream_ids.len()
    }
}

/// One provider's stream for a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCandidate {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub provider_id: String,
    pub provider_priority: i32,
    pub stream_url: String,
    pub original_name: String,
    pub logo_url: Option<String>,
    pub quality: QualityInfo,
    pub health_state: HealthState,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub next_check_at: Option<DateTime<Utc>>,
    pub last_response_time_ms: Option<u64>,
    pub last_error: Option<String>,
    pub priority_rank: u32,
    /// Registry-wide creation order, used as the final ranking tie-break
    pub insertion_seq: u64,
    /// Consecutive provider syncs this stream was absent from
    pub missed_syncs: u32,
    pub created_at: DateTime<Utc>,
}

impl StreamCandidate {
    pub fn quality_score(&self) -> u32 {
        self.quality.quality_score
    }
}

/// How a stream was assigned to its channel
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MergeMethod {
    Exact,
    Fuzzy,
    Logo,
    /// No existing channel matched; a new channel was created
    #[serde(rename = "none")]
    #[strum(serialize = "none")]
    NoMatch,
    /// Split or merge applied by an operator
    Manual,
}

/// A channel that qualified during matching, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCandidate {
    pub channel_id: Uuid,
    pub canonical_key: String,
    pub score: f64,
    pub stream_count: usize,
}

/// Audit record of a single merge decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeDecision {
    pub stream_id: Uuid,
    pub matched_channel_id: Uuid,
    pub method: MergeMethod,
    /// 0-100
    pub confidence: f64,
    pub reason: String,
    pub candidates: Vec<MergeCandidate>,
    pub decided_at: DateTime<Utc>,
}

/// Read-only projection of a stream inside a ranked view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedStream {
    pub stream_id: Uuid,
    pub provider_id: String,
    pub stream_url: String,
    pub quality_score: u32,
    pub resolution: Resolution,
    pub health_state: HealthState,
    /// Diagnostic 0-100 from recent failures and latency
    pub health_score: u8,
    pub priority_rank: u32,
}

impl From<&StreamCandidate> for RankedStream {
    fn from(stream: &StreamCandidate) -> Self {
        Self {
            stream_id: stream.id,
            provider_id: stream.provider_id.clone(),
            stream_url: stream.stream_url.clone(),
            quality_score: stream.quality.quality_score,
            resolution: stream.quality.resolution,
            health_state: stream.health_state,
            health_score: health_score(stream.consecutive_failures, stream.last_response_time_ms),
            priority_rank: stream.priority_rank,
        }
    }
}

/// Consistent snapshot of a channel and its ordered streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelView {
    pub channel_id: Uuid,
    pub canonical_name: String,
    pub canonical_key: String,
    pub region: Option<Region>,
    pub variant: Option<Variant>,
    pub category: Option<String>,
    pub epg_id: Option<String>,
    pub logo_url: Option<String>,
    pub enabled: bool,
    /// Score of the primary stream, or of the best dead stream when none is
    /// active; zero only when the channel has no streams at all
    pub quality_score: u32,
    pub streams: Vec<RankedStream>,
}

impl ChannelView {
    pub fn primary(&self) -> Option<&RankedStream> {
        self.streams.iter().find(|s| s.health_state.is_active())
    }
}
