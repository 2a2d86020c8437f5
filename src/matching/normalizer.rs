//! Channel name normalization
//!
//! Provider labels carry a lot of noise around the part that identifies the
//! channel: country tags (`US: `, `UK | `), bracketed source notes (`(SAT)`,
//! `[Backup]`) and resolution/codec suffixes. The normalizer reduces a raw
//! label to lowercase alphanumeric tokens separated by single spaces, with `+`
//! kept as its own token so `ESPN+` stays distinguishable from `ESPN`.
//!
//! The output is a fixed point: normalizing an already normalized name returns
//! it unchanged.

use regex::Regex;
use std::sync::LazyLock;

static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)|\{[^}]*\}").expect("static regex"));

static PREFIX_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[A-Za-z]{2,3}\s*[:|]\s*").expect("static regex"));

static FRAME_RATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2,3}fps$").expect("static regex"));

/// Resolution tokens that may be promoted to identity variants
const RESOLUTION_VARIANT_TOKENS: &[&str] = &[
    "uhd", "4k", "2160p", "fhd", "1080p", "1080i", "hd", "720p", "sd", "576p", "480p",
];

/// Quality noise that never identifies a channel
const QUALITY_NOISE_TOKENS: &[&str] = &[
    "qhd", "1440p", "hevc", "h264", "h265", "x264", "x265", "avc", "hdr", "hdr10", "sdr", "raw",
];

/// Output of [`ChannelNameNormalizer::normalize_with_fallback`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedName {
    pub value: String,
    /// The regular pipeline produced nothing and a fallback stage was used
    pub fallback: bool,
}

/// Reduces raw provider labels to comparable names
#[derive(Debug, Clone, Default)]
pub struct ChannelNameNormalizer {
    keep_resolution_tokens: bool,
}

impl ChannelNameNormalizer {
    /// `keep_resolution_tokens` leaves HD/FHD/UHD/4K/SD in place so the
    /// classifier can turn them into variants
    pub fn new(keep_resolution_tokens: bool) -> Self {
        Self {
            keep_resolution_tokens,
        }
    }

    pub fn normalize(&self, raw: &str) -> String {
        self.normalize_with_fallback(raw).value
    }

    /// Normalize, falling back through progressively less aggressive stages
    /// when the regular pipeline leaves nothing behind
    pub fn normalize_with_fallback(&self, raw: &str) -> NormalizedName {
        let lowered = raw.to_lowercase();

        let stripped = self.pipeline(&lowered, true);
        if !stripped.is_empty() {
            return NormalizedName {
                value: stripped,
                fallback: false,
            };
        }

        // Bracketed content unwrapped rather than dropped, prefix kept
        let unwrapped = self.pipeline(&lowered, false);
        if !unwrapped.is_empty() {
            return NormalizedName {
                value: unwrapped,
                fallback: true,
            };
        }

        let bare = tokenize(&lowered).join(" ");
        if !bare.is_empty() {
            return NormalizedName {
                value: bare,
                fallback: true,
            };
        }

        NormalizedName {
            value: lowered.split_whitespace().collect::<Vec<_>>().join(" "),
            fallback: true,
        }
    }

    /// Case-preserving label with brackets, prefix tag and quality tokens
    /// removed, e.g. `"US: CNN HD"` becomes `"CNN"`
    pub fn display_name(&self, raw: &str) -> String {
        let without_brackets = BRACKETED.replace_all(raw, " ");
        let without_prefix = PREFIX_TAG.replace(&without_brackets, "");

        let words: Vec<&str> = without_prefix
            .split_whitespace()
            .filter(|word| {
                let tokens = tokenize(&word.to_lowercase());
                !tokens.is_empty() && tokens.iter().any(|t| !self.is_noise(t))
            })
            .collect();

        if words.is_empty() {
            raw.split_whitespace().collect::<Vec<_>>().join(" ")
        } else {
            words.join(" ")
        }
    }

    /// Whether a token is resolution or codec noise under this configuration
    pub fn is_noise(&self, token: &str) -> bool {
        if QUALITY_NOISE_TOKENS.contains(&token) || FRAME_RATE.is_match(token) {
            return true;
        }
        !self.keep_resolution_tokens && RESOLUTION_VARIANT_TOKENS.contains(&token)
    }

    fn pipeline(&self, lowered: &str, strip_groups: bool) -> String {
        let cleaned = if strip_groups {
            let without_brackets = BRACKETED.replace_all(lowered, " ");
            PREFIX_TAG.replace(&without_brackets, "").into_owned()
        } else {
            lowered.to_string()
        };

        tokenize(&cleaned)
            .into_iter()
            .filter(|token| !self.is_noise(token))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Split into alphanumeric runs, with every `+` as a token of its own
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in input.chars() {
        if ch.is_alphanumeric() {
            current.push(ch);
            continue;
        }
        if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        if ch == '+' {
            tokens.push("+".to_string());
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("CNN", "cnn")]
    #[case("CNN HD", "cnn")]
    #[case("US: CNN (1080p)", "cnn")]
    #[case("UK | BBC One [Backup]", "bbc one")]
    #[case("ESPN+", "espn +")]
    #[case("ESPN Plus", "espn plus")]
    #[case("Sportsnet   East  FHD", "sportsnet east")]
    #[case("Discovery.Channel-HEVC", "discovery channel")]
    #[case("TSN 2 {50fps}", "tsn 2")]
    fn test_normalize(#[case] raw: &str, #[case] expected: &str) {
        let normalizer = ChannelNameNormalizer::default();
        let result = normalizer.normalize_with_fallback(raw);
        assert_eq!(result.value, expected);
        assert!(!result.fallback);
    }

    #[test]
    fn test_resolution_tokens_kept_when_configured() {
        let normalizer = ChannelNameNormalizer::new(true);
        assert_eq!(normalizer.normalize("CNN HD"), "cnn hd");
        assert_eq!(normalizer.normalize("CNN HEVC 4K"), "cnn 4k");
    }

    #[rstest]
    #[case("(CNN)", "cnn")]
    #[case("[HD]", "hd")]
    #[case("!!!", "!!!")]
    #[case("  --  ** ", "-- **")]
    fn test_fallback(#[case] raw: &str, #[case] expected: &str) {
        let normalizer = ChannelNameNormalizer::default();
        let result = normalizer.normalize_with_fallback(raw);
        assert_eq!(result.value, expected);
        assert!(result.fallback);
    }

    #[rstest]
    #[case("US: CNN HD", "CNN")]
    #[case("Sportsnet East (Backup)", "Sportsnet East")]
    #[case("ESPN+ 1080p", "ESPN+")]
    #[case("[HD]", "[HD]")]
    fn test_display_name(#[case] raw: &str, #[case] expected: &str) {
        let normalizer = ChannelNameNormalizer::default();
        assert_eq!(normalizer.display_name(raw), expected);
    }

    proptest! {
        #[test]
        fn test_normalize_is_idempotent(raw in "[a-zA-Z0-9 +:|()\\[\\]{}._éü-]{1,40}") {
            for keep in [false, true] {
                let normalizer = ChannelNameNormalizer::new(keep);
                let once = normalizer.normalize(&raw);
                let twice = normalizer.normalize(&once);
                prop_assert_eq!(once, twice);
            }
        }
    }
}
