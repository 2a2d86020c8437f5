//! Stream quality scoring
//!
//! Resolution is taken from the first source that names it: an explicit token
//! in the stream's name, then a token in its URL, then an active probe. Bitrate,
//! codec and frame rate only ever come from a probe.

use regex::Regex;
use std::sync::LazyLock;
use url::Url;

use crate::models::{QualityInfo, QualitySource, Resolution};

pub mod ffprobe;

pub use ffprobe::{FfprobeQualityProbe, QualityProbe};

static TOKEN_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9]+").expect("static regex"));

/// Highest tier first
const RESOLUTION_TOKENS: &[(&[&str], Resolution)] = &[
    (&["2160P", "4K", "UHD", "8K"], Resolution::Uhd2160),
    (&["1440P", "QHD"], Resolution::Qhd1440),
    (&["1080P", "1080I", "FHD"], Resolution::Fhd1080),
    (&["720P", "HD"], Resolution::Hd720),
    (&["576P", "480P", "360P", "SD"], Resolution::Sd),
];

const MAX_BITRATE_BONUS: u32 = 150;

/// Video properties reported by an active probe
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamMetrics {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate_kbps: Option<u32>,
    pub codec: Option<String>,
    pub fps: Option<f32>,
}

impl StreamMetrics {
    pub fn resolution(&self) -> Option<Resolution> {
        self.height.map(resolution_from_height)
    }
}

/// Base score of a resolution tier
pub fn tier_score(resolution: Resolution) -> u32 {
    match resolution {
        Resolution::Uhd2160 => 1000,
        Resolution::Qhd1440 => 850,
        Resolution::Fhd1080 => 700,
        Resolution::Hd720 => 400,
        Resolution::Sd => 100,
        Resolution::Unknown => 50,
    }
}

pub fn codec_bonus(codec: &str) -> u32 {
    match codec.to_ascii_lowercase().as_str() {
        "av1" | "libaom-av1" | "av01" => 30,
        "hevc" | "h265" | "x265" => 25,
        "vp9" => 20,
        _ => 0,
    }
}

pub fn bitrate_bonus(bitrate_kbps: u32) -> u32 {
    (bitrate_kbps / 100).min(MAX_BITRATE_BONUS)
}

pub fn resolution_from_height(height: u32) -> Resolution {
    match height {
        h if h >= 2160 => Resolution::Uhd2160,
        h if h >= 1440 => Resolution::Qhd1440,
        h if h >= 1080 => Resolution::Fhd1080,
        h if h >= 720 => Resolution::Hd720,
        0 => Resolution::Unknown,
        _ => Resolution::Sd,
    }
}

/// Best resolution named by a token of `text`
pub fn resolution_from_tokens(text: &str) -> Option<Resolution> {
    let tokens: Vec<String> = TOKEN_SPLIT
        .split(text)
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_uppercase())
        .collect();

    RESOLUTION_TOKENS
        .iter()
        .find(|(names, _)| tokens.iter().any(|t| names.contains(&t.as_str())))
        .map(|(_, resolution)| *resolution)
}

/// Resolution token in the URL's path or query; host and credentials are ignored
pub fn resolution_from_url(stream_url: &str) -> Option<Resolution> {
    match Url::parse(stream_url) {
        Ok(url) => {
            let path = url.path();
            let query = url.query().unwrap_or_default();
            resolution_from_tokens(&format!("{path} {query}"))
        }
        Err(_) => resolution_from_tokens(stream_url),
    }
}

/// Stateless scorer for stream quality
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityAnalyzer;

impl QualityAnalyzer {
    /// Score a stream from its name, its URL and optionally probe metrics
    pub fn analyze(
        &self,
        original_name: &str,
        stream_url: &str,
        metrics: Option<&StreamMetrics>,
    ) -> QualityInfo {
        let (resolution, source) = if let Some(r) = resolution_from_tokens(original_name) {
            (r, QualitySource::Name)
        } else if let Some(r) = resolution_from_url(stream_url) {
            (r, QualitySource::Url)
        } else if let Some(r) = metrics.and_then(StreamMetrics::resolution) {
            (r, QualitySource::Probe)
        } else if metrics.is_some() {
            (Resolution::Unknown, QualitySource::Probe)
        } else {
            (Resolution::Unknown, QualitySource::None)
        };

        let mut info = QualityInfo {
            resolution,
            bitrate_kbps: metrics.and_then(|m| m.bitrate_kbps),
            codec: metrics.and_then(|m| m.codec.clone()),
            fps: metrics.and_then(|m| m.fps),
            quality_score: 0,
            source,
        };
        info.quality_score = self.score(&info);
        info
    }

    /// Re-score after a name or URL change, keeping earlier probe figures
    pub fn rescore(&self, original_name: &str, stream_url: &str, previous: &QualityInfo) -> QualityInfo {
        let has_probe_data = previous.bitrate_kbps.is_some()
            || previous.codec.is_some()
            || previous.fps.is_some()
            || previous.source == QualitySource::Probe;
        if !has_probe_data {
            return self.analyze(original_name, stream_url, None);
        }

        let metrics = StreamMetrics {
            width: None,
            height: None,
            bitrate_kbps: previous.bitrate_kbps,
            codec: previous.codec.clone(),
            fps: previous.fps,
        };
        let mut info = self.analyze(original_name, stream_url, Some(&metrics));
        if info.source == QualitySource::Probe && previous.source == QualitySource::Probe {
            info.resolution = previous.resolution;
            info.quality_score = self.score(&info);
        }
        info
    }

    /// `tier + min(kbps / 100, 150) + codec bonus`; never zero
    pub fn score(&self, info: &QualityInfo) -> u32 {
        tier_score(info.resolution)
            + info.bitrate_kbps.map(bitrate_bonus).unwrap_or(0)
            + info.codec.as_deref().map(codec_bonus).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("CNN 4K", Some(Resolution::Uhd2160))]
    #[case("CNN UHD", Some(Resolution::Uhd2160))]
    #[case("CNN (1080p)", Some(Resolution::Fhd1080))]
    #[case("CNN FHD", Some(Resolution::Fhd1080))]
    #[case("CNN HD", Some(Resolution::Hd720))]
    #[case("CNN SD", Some(Resolution::Sd))]
    #[case("CNN", None)]
    #[case("HDTV Channel", None)]
    #[case("Sky HD 4K", Some(Resolution::Uhd2160))]
    fn test_resolution_from_name(#[case] name: &str, #[case] expected: Option<Resolution>) {
        assert_eq!(resolution_from_tokens(name), expected);
    }

    #[test]
    fn test_resolution_from_url_ignores_host() {
        assert_eq!(
            resolution_from_url("http://hd.example.com/live/cnn_720p.m3u8"),
            Some(Resolution::Hd720)
        );
        assert_eq!(resolution_from_url("http://hd.example.com/live/cnn.m3u8"), None);
    }

    #[test]
    fn test_precedence_name_over_url_over_probe() {
        let analyzer = QualityAnalyzer;
        let metrics = StreamMetrics {
            height: Some(2160),
            bitrate_kbps: Some(8000),
            codec: Some("hevc".to_string()),
            ..Default::default()
        };

        let info = analyzer.analyze("CNN HD", "http://x/cnn_1080p.ts", Some(&metrics));
        assert_eq!(info.resolution, Resolution::Hd720);
        assert_eq!(info.source, QualitySource::Name);
        assert_eq!(info.quality_score, 400 + 80 + 25);

        let info = analyzer.analyze("CNN", "http://x/cnn_1080p.ts", Some(&metrics));
        assert_eq!(info.source, QualitySource::Url);
        assert_eq!(info.resolution, Resolution::Fhd1080);

        let info = analyzer.analyze("CNN", "http://x/cnn.ts", Some(&metrics));
        assert_eq!(info.source, QualitySource::Probe);
        assert_eq!(info.quality_score, 1000 + 80 + 25);
    }

    #[test]
    fn test_score_never_zero() {
        let info = QualityAnalyzer.analyze("CNN", "http://x/cnn.ts", None);
        assert_eq!(info.resolution, Resolution::Unknown);
        assert_eq!(info.quality_score, 50);
    }

    #[test]
    fn test_bitrate_bonus_capped() {
        assert_eq!(bitrate_bonus(99), 0);
        assert_eq!(bitrate_bonus(5000), 50);
        assert_eq!(bitrate_bonus(40_000), 150);
    }

    #[test]
    fn test_rescore_keeps_probe_figures() {
        let analyzer = QualityAnalyzer;
        let metrics = StreamMetrics {
            height: Some(1080),
            bitrate_kbps: Some(3000),
            codec: Some("av1".to_string()),
            ..Default::default()
        };
        let probed = analyzer.analyze("CNN", "http://x/cnn.ts", Some(&metrics));
        assert_eq!(probed.quality_score, 700 + 30 + 30);

        let rescored = analyzer.rescore("CNN", "http://x/cnn.ts", &probed);
        assert_eq!(rescored, probed);

        let renamed = analyzer.rescore("CNN 4K", "http://x/cnn.ts", &probed);
        assert_eq!(renamed.resolution, Resolution::Uhd2160);
        assert_eq!(renamed.bitrate_kbps, Some(3000));
    }
}
