//! Operator-defined rules that keep specific channels apart
//!
//! A never-merge rule names a pattern for the incoming stream and a pattern for
//! the existing channel. When both match (and the optional region filters
//! agree) the existing channel is removed from the fuzzy and logo candidate
//! lists. Exact canonical-key matches are not affected.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::Region;
use crate::errors::{ResolverError, ResolverResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRule {
    /// Regex applied to the incoming stream's raw name
    pub pattern_new: String,
    /// Regex applied to the existing channel's canonical name
    pub pattern_existing: String,
    #[serde(default)]
    pub region_new: Option<Region>,
    #[serde(default)]
    pub region_existing: Option<Region>,
    /// Higher priorities are evaluated first
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl MergeRule {
    pub fn never_merge<N: Into<String>, E: Into<String>>(pattern_new: N, pattern_existing: E) -> Self {
        Self {
            pattern_new: pattern_new.into(),
            pattern_existing: pattern_existing.into(),
            region_new: None,
            region_existing: None,
            priority: 0,
            enabled: true,
            reason: None,
        }
    }

    pub fn compile(&self) -> ResolverResult<CompiledMergeRule> {
        let build = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    ResolverError::configuration(format!("Invalid merge rule pattern '{pattern}': {e}"))
                })
        };

        Ok(CompiledMergeRule {
            new_regex: build(&self.pattern_new)?,
            existing_regex: build(&self.pattern_existing)?,
            rule: self.clone(),
        })
    }
}

/// A [`MergeRule`] with its patterns compiled
#[derive(Debug, Clone)]
pub struct CompiledMergeRule {
    pub rule: MergeRule,
    new_regex: Regex,
    existing_regex: Regex,
}

impl CompiledMergeRule {
    /// Whether this rule forbids merging the new stream into the existing channel
    pub fn forbids(
        &self,
        new_name: &str,
        new_region: Option<Region>,
        existing_name: &str,
        existing_region: Option<Region>,
    ) -> bool {
        if !self.rule.enabled {
            return false;
        }
        if !self.new_regex.is_match(new_name) || !self.existing_regex.is_match(existing_name) {
            return false;
        }
        if let (Some(wanted), Some(actual)) = (self.rule.region_new, new_region)
            && wanted != actual
        {
            return false;
        }
        if let (Some(wanted), Some(actual)) = (self.rule.region_existing, existing_region)
            && wanted != actual
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_matches_both_sides() {
        let rule = MergeRule::never_merge("^cnn international", "^cnn$").compile().unwrap();

        assert!(rule.forbids("CNN International", None, "CNN", None));
        assert!(!rule.forbids("CNN", None, "CNN", None));
        assert!(!rule.forbids("CNN International", None, "CNN Headlines", None));
    }

    #[test]
    fn test_region_filter_and_disabled() {
        let mut rule = MergeRule::never_merge("global", "global");
        rule.region_new = Some(Region::East);
        let compiled = rule.compile().unwrap();

        assert!(compiled.forbids("Global", Some(Region::East), "Global", None));
        assert!(!compiled.forbids("Global", Some(Region::West), "Global", None));

        rule.enabled = false;
        let compiled = rule.compile().unwrap();
        assert!(!compiled.forbids("Global", Some(Region::East), "Global", None));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = MergeRule::never_merge("(", "x").compile().unwrap_err();
        assert!(err.is_fatal());
    }
}
