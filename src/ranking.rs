//! Priority order of interchangeable streams within a channel
//!
//! Active streams (alive, unknown, degraded) come first, ordered by quality
//! score descending, then health, then provider priority, then insertion
//! order. Dead streams follow in the same order so operators can still see
//! them.

use std::cmp::Ordering;
use uuid::Uuid;

use crate::models::StreamCandidate;

/// Total order used for ranking; `Less` means `a` is tried before `b`
pub fn compare_streams(a: &StreamCandidate, b: &StreamCandidate) -> Ordering {
    b.health_state
        .is_active()
        .cmp(&a.health_state.is_active())
        .then_with(|| b.quality.quality_score.cmp(&a.quality.quality_score))
        .then_with(|| a.health_state.rank_order().cmp(&b.health_state.rank_order()))
        .then_with(|| a.provider_priority.cmp(&b.provider_priority))
        .then_with(|| a.insertion_seq.cmp(&b.insertion_seq))
        .then_with(|| a.id.cmp(&b.id))
}

/// Stream ids in priority order
pub fn rank_streams<'a, I>(streams: I) -> Vec<Uuid>
where
    I: IntoIterator<Item = &'a StreamCandidate>,
{
    let mut ordered: Vec<&StreamCandidate> = streams.into_iter().collect();
    ordered.sort_by(|a, b| compare_streams(a, b));
    ordered.into_iter().map(|s| s.id).collect()
}
