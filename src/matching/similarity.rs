//! Token-order-insensitive string similarity

/// Similarity of two names on a 0-100 scale, ignoring token order
///
/// Tokens are sorted before a normalized Levenshtein comparison, so
/// `"bbc one"` and `"one bbc"` score 100.
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let a = sorted_tokens(a);
    let b = sorted_tokens(b);

    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 100.0;
    }

    strsim::normalized_levenshtein(&a, &b) * 100.0
}

fn sorted_tokens(name: &str) -> String {
    let mut tokens: Vec<&str> = name.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}
