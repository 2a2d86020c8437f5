//! Channel identity: normalization, classification and merge matching

pub mod classifier;
pub mod logo;
pub mod matcher;
pub mod normalizer;
pub mod similarity;

pub use classifier::RegionVariantClassifier;
pub use logo::{AverageHashLogoProvider, LogoHash, LogoSimilarity};
pub use matcher::{ChannelMatcher, ChannelSnapshot, MatchOutcome, MatchRequest};
pub use normalizer::ChannelNameNormalizer;
pub use similarity::token_sort_ratio;

use crate::models::NormalizedIdentity;

/// Turns a raw provider label into a [`NormalizedIdentity`]
#[derive(Debug, Clone, Default)]
pub struct IdentityExtractor {
    normalizer: ChannelNameNormalizer,
    classifier: RegionVariantClassifier,
}

impl IdentityExtractor {
    pub fn new(quality_tokens_as_variants: bool) -> Self {
        Self {
            normalizer: ChannelNameNormalizer::new(quality_tokens_as_variants),
            classifier: RegionVariantClassifier::new(quality_tokens_as_variants),
        }
    }

    pub fn identify(&self, raw_name: &str) -> NormalizedIdentity {
        let normalized = self.normalizer.normalize_with_fallback(raw_name);
        NormalizedIdentity {
            key: self.classifier.classify(&normalized.value),
            display_name: self.normalizer.display_name(raw_name),
            fallback: normalized.fallback,
        }
    }
}
