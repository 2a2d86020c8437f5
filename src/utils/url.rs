//! URL utilities for stream and logo addresses
//!
//! Provider URLs routinely embed credentials (Xtream `username`/`password`
//! path segments or query parameters), so anything that reaches a log goes
//! through [`UrlUtils::obfuscate_credentials`].

use regex::Regex;
use std::sync::LazyLock;
use url::Url;

static SENSITIVE_QUERY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([?&](?:username|password|user|pass|pwd|passwd|token)=)[^&]*")
        .expect("static regex")
});

/// Xtream live paths: /live/<user>/<pass>/<id>.ts
static XTREAM_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/(live|movie|series)/[^/]+/[^/]+/").expect("static regex")
});

/// URL utilities for consistent URL handling
pub struct UrlUtils;

impl UrlUtils {
    /// Parse and validate a stream URL
    ///
    /// A stream URL must parse and carry a scheme the engine knows how to
    /// address; the host may be empty only for `udp`/`rtp` multicast forms.
    pub fn parse_stream_url(url: &str) -> Result<Url, String> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err("stream url is empty".to_string());
        }

        let parsed = Url::parse(trimmed).map_err(|e| format!("unparseable stream url: {e}"))?;
        match parsed.scheme() {
            "http" | "https" | "rtmp" | "rtmps" | "rtsp" | "udp" | "rtp" => {}
            other => return Err(format!("unsupported stream url scheme '{other}'")),
        }
        if matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_none() {
            return Err("stream url has no host".to_string());
        }
        Ok(parsed)
    }

    /// Whether the URL can be probed over HTTP
    pub fn is_http(url: &str) -> bool {
        Url::parse(url)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false)
    }

    /// Obfuscate credentials in URLs for safe logging
    pub fn obfuscate_credentials(url: &str) -> String {
        let mut obfuscated = url.to_string();

        if let Ok(parsed) = Url::parse(url)
            && (!parsed.username().is_empty() || parsed.password().is_some())
        {
            let mut new_url = parsed.clone();
            let _ = new_url.set_username("****");
            let _ = new_url.set_password(Some("****"));
            obfuscated = new_url.to_string();
        }

        obfuscated = SENSITIVE_QUERY
            .replace_all(&obfuscated, "${1}****")
            .to_string();
        XTREAM_PATH
            .replace_all(&obfuscated, "/$1/****/****/")
            .to_string()
    }
}
