//! Region and variant classification of normalized channel names
//!
//! Both tables are ordered and the first entry found in the name wins. The
//! matched token is taken out of the base name, so `"sportsnet east"` becomes
//! base `"sportsnet"` with region `East`.

use crate::models::{CanonicalKey, Region, Variant};

const REGION_TABLE: &[(&str, Region)] = &[
    ("east", Region::East),
    ("eastern", Region::East),
    ("west", Region::West),
    ("western", Region::West),
    ("north", Region::North),
    ("south", Region::South),
    ("central", Region::Central),
    ("pacific", Region::Pacific),
    ("mountain", Region::Mountain),
    ("atlantic", Region::Atlantic),
    ("ontario", Region::Ontario),
    ("quebec", Region::Quebec),
    ("alberta", Region::Alberta),
    ("bc", Region::BritishColumbia),
    ("prairies", Region::Prairies),
];

const VARIANT_TABLE: &[(&str, Variant)] = &[
    ("+", Variant::Plus),
    ("plus", Variant::Plus),
    ("premium", Variant::Premium),
    ("extra", Variant::Extra),
    ("news", Variant::News),
    ("sports", Variant::Sports),
    ("movies", Variant::Movies),
];

/// Only consulted when resolution tokens are identity variants
const RESOLUTION_VARIANT_TABLE: &[(&str, Variant)] = &[
    ("uhd", Variant::Uhd),
    ("4k", Variant::Uhd),
    ("2160p", Variant::Uhd),
    ("fhd", Variant::Fhd),
    ("1080p", Variant::Fhd),
    ("1080i", Variant::Fhd),
    ("hd", Variant::Hd),
    ("720p", Variant::Hd),
    ("sd", Variant::Sd),
    ("576p", Variant::Sd),
    ("480p", Variant::Sd),
];

/// Splits a normalized name into base name, region and variant
#[derive(Debug, Clone, Default)]
pub struct RegionVariantClassifier {
    resolution_variants: bool,
}

impl RegionVariantClassifier {
    pub fn new(resolution_variants: bool) -> Self {
        Self {
            resolution_variants,
        }
    }

    pub fn classify(&self, normalized: &str) -> CanonicalKey {
        let mut tokens: Vec<&str> = normalized.split_whitespace().collect();

        let region = take_first(&mut tokens, REGION_TABLE);
        let variant = take_first(&mut tokens, VARIANT_TABLE)
            .or_else(|| take_trailing_number(&mut tokens))
            .or_else(|| {
                if self.resolution_variants {
                    take_first(&mut tokens, RESOLUTION_VARIANT_TABLE)
                } else {
                    None
                }
            });

        let base_name = if tokens.is_empty() {
            normalized.to_string()
        } else {
            tokens.join(" ")
        };

        CanonicalKey::new(base_name, region, variant)
    }
}

/// Remove the last occurrence of the first table keyword present in `tokens`
fn take_first<T: Copy>(tokens: &mut Vec<&str>, table: &[(&str, T)]) -> Option<T> {
    for (keyword, value) in table {
        if let Some(index) = tokens.iter().rposition(|t| t == keyword) {
            tokens.remove(index);
            return Some(*value);
        }
    }
    None
}

/// A trailing one or two digit token, as in "TSN 2"
fn take_trailing_number(tokens: &mut Vec<&str>) -> Option<Variant> {
    let last = tokens.last()?;
    if last.len() > 2 || !last.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let number = last.parse::<u16>().ok()?;
    tokens.pop();
    Some(Variant::Numbered(number))
}
