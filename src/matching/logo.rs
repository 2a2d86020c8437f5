//! Perceptual logo hashing
//!
//! Logos are compared with a 64-bit average hash: the image is shrunk to 8x8
//! greyscale and each bit records whether a pixel is brighter than the mean.
//! Two logos of the same brand re-encoded or rescaled by different providers
//! end up a few bits apart.

use async_trait::async_trait;
use image::DynamicImage;
use image::imageops::FilterType;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::defaults::DEFAULT_LOGO_CACHE_SIZE;
use crate::errors::{ProbeError, ProbeResult};
use crate::utils::UrlUtils;

const HASH_SIDE: u32 = 8;

/// 64-bit perceptual hash of a logo image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogoHash(pub u64);

impl LogoHash {
    /// Number of differing bits, 0-64
    pub fn distance(&self, other: &LogoHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

/// Average hash of a decoded image
pub fn average_hash(image: &DynamicImage) -> LogoHash {
    let small = image
        .resize_exact(HASH_SIDE, HASH_SIDE, FilterType::Triangle)
        .to_luma8();

    let pixels: Vec<u32> = small.pixels().map(|p| p.0[0] as u32).collect();
    let mean = pixels.iter().sum::<u32>() / pixels.len().max(1) as u32;

    let bits = pixels
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, &value)| if value > mean { acc | (1 << i) } else { acc });

    LogoHash(bits)
}

/// Source of logo hashes for the matcher
#[async_trait]
pub trait LogoSimilarity: Send + Sync {
    async fn logo_hash(&self, logo_url: &str) -> ProbeResult<LogoHash>;
}

/// Downloads logos over HTTP and hashes them, remembering recent results
pub struct AverageHashLogoProvider {
    client: reqwest::Client,
    cache: Mutex<LruCache<String, LogoHash>>,
}

impl AverageHashLogoProvider {
    pub fn new(fetch_timeout: Duration, cache_size: usize) -> ProbeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(ProbeError::connection)?;

        Ok(Self::with_client(client, cache_size))
    }

    pub fn with_client(client: reqwest::Client, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size)
            .or(NonZeroUsize::new(DEFAULT_LOGO_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);

        Self {
            client,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    async fn fetch_and_hash(&self, logo_url: &str) -> ProbeResult<LogoHash> {
        let response = self
            .client
            .get(logo_url)
            .send()
            .await
            .map_err(ProbeError::connection)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(ProbeError::connection)?;
        let image = image::load_from_memory(&bytes).map_err(|e| ProbeError::Analysis {
            message: format!("failed to decode logo: {e}"),
        })?;

        Ok(average_hash(&image))
    }
}

#[async_trait]
impl LogoSimilarity for AverageHashLogoProvider {
    async fn logo_hash(&self, logo_url: &str) -> ProbeResult<LogoHash> {
        if let Some(hash) = self.cache.lock().await.get(logo_url) {
            return Ok(*hash);
        }

        let hash = self.fetch_and_hash(logo_url).await.inspect_err(|e| {
            debug!(
                "Logo hash failed for {}: {}",
                UrlUtils::obfuscate_credentials(logo_url),
                e
            );
        })?;

        self.cache.lock().await.put(logo_url.to_string(), hash);
        Ok(hash)
    }
}
