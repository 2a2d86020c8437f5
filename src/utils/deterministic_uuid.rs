//! Deterministic UUID Generation
//!
//! Streams and channels get identifiers derived from their identifying inputs,
//! so two independent runs over the same provider batch assign identical ids.
//! SHA-256 is used instead of `DefaultHasher` because its output is stable
//! across Rust releases and processes.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a deterministic UUID based on displayable inputs
///
/// Inputs are length-prefixed before hashing so `["ab", "c"]` and
/// `["a", "bc"]` produce different ids.
///
/// ```rust
/// use channel_resolver::utils::generate_deterministic_uuid;
///
/// let a = generate_deterministic_uuid(&[&"provider-a", &"http://example.com/1.ts"]);
/// let b = generate_deterministic_uuid(&[&"provider-a", &"http://example.com/1.ts"]);
/// assert_eq!(a, b);
/// ```
pub fn generate_deterministic_uuid(inputs: &[&dyn std::fmt::Display]) -> Uuid {
    let mut hasher = Sha256::new();

    for input in inputs {
        let value = input.to_string();
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value.as_bytes());
    }

    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);

    uuid::Builder::from_custom_bytes(bytes).into_uuid()
}

/// Stream identity: one provider serving one URL
pub fn generate_stream_uuid(provider_id: &str, stream_url: &str) -> Uuid {
    generate_deterministic_uuid(&[&"stream", &provider_id, &stream_url.trim()])
}

/// Channel identity: the bucket it was founded for plus the founding stream
pub fn generate_channel_uuid(canonical_key: &str, founding_stream: &Uuid) -> Uuid {
    generate_deterministic_uuid(&[&"channel", &canonical_key, founding_stream])
}
