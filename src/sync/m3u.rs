//! Extended M3U playlists to raw provider entries
//!
//! `#EXTINF:-1 tvg-id="..." tvg-logo="..." group-title="...",Channel Name`
//! followed by the stream URL on the next non-comment line.

use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::models::RawChannelEntry;

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z0-9_-]+)\s*=\s*"([^"]*)""#).expect("static regex")
});

#[derive(Debug, Default)]
struct ExtInf {
    name: String,
    tvg_id: Option<String>,
    tvg_name: Option<String>,
    tvg_logo: Option<String>,
    group_title: Option<String>,
}

/// Parse playlist `content` into entries for `provider_id`
///
/// Entries without a URL line are dropped. Validation of names and URLs is
/// left to the registry so malformed entries are reported in one place.
pub fn parse_m3u(content: &str, provider_id: &str, provider_priority: i32) -> Vec<RawChannelEntry> {
    let mut entries = Vec::new();
    let mut pending: Option<ExtInf> = None;

    for line in content.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if pending.is_some() {
                debug!("EXTINF without stream URL in playlist for '{}'", provider_id);
            }
            pending = Some(parse_extinf(rest));
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let Some(info) = pending.take() else {
            continue;
        };
        let name = if info.name.is_empty() {
            info.tvg_name.unwrap_or_default()
        } else {
            info.name
        };

        entries.push(RawChannelEntry {
            provider_id: provider_id.to_string(),
            raw_name: name,
            stream_url: line.to_string(),
            logo_url: info.tvg_logo.filter(|l| !l.is_empty()),
            category: info.group_title.filter(|g| !g.is_empty()),
            epg_id: info.tvg_id.filter(|id| !id.is_empty()),
            provider_priority,
        });
    }

    info!(
        "Parsed {} entries from M3U playlist for provider '{}'",
        entries.len(),
        provider_id
    );
    entries
}

fn parse_extinf(rest: &str) -> ExtInf {
    // the display name follows the first comma outside quotes
    let mut in_quotes = false;
    let split = rest.char_indices().find_map(|(i, ch)| match ch {
        '"' => {
            in_quotes = !in_quotes;
            None
        }
        ',' if !in_quotes => Some(i),
        _ => None,
    });

    let (attributes, name) = match split {
        Some(i) => (&rest[..i], rest[i + 1..].trim()),
        None => (rest, ""),
    };

    let mut info = ExtInf {
        name: name.to_string(),
        ..Default::default()
    };
    for caps in ATTRIBUTE.captures_iter(attributes) {
        let value = caps[2].trim().to_string();
        match &caps[1] {
            "tvg-id" => info.tvg_id = Some(value),
            "tvg-name" => info.tvg_name = Some(value),
            "tvg-logo" => info.tvg_logo = Some(value),
            "group-title" => info.group_title = Some(value),
            _ => {}
        }
    }
    info
}
