//! URL slugs for listings and dimensions.

use sha2::{Digest, Sha256};

/// Hex characters of the disambiguation suffix.
const SUFFIX_LEN: usize = 8;

/// Lowercase ASCII alphanumerics joined by single hyphens.
///
/// Apostrophes are dropped rather than turned into separators so
/// "Joe's Suds" becomes `joes-suds`.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if ch == '\'' || ch == '\u{2019}' {
            continue;
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

/// Deterministic suffix derived from the listing's identifying fields.
///
/// The same normalized inputs always give the same suffix, so re-running an
/// import reproduces the same slugs.
pub fn disambiguation_suffix(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.trim().to_lowercase().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..SUFFIX_LEN].to_string()
}

/// Listing slug: name, city and state followed by the suffix.
pub fn listing_slug(name: &str, city: &str, state_abbreviation: &str, suffix: &str) -> String {
    let base = slugify(&format!("{name} {city} {state_abbreviation}"));
    if base.is_empty() {
        suffix.to_string()
    } else {
        format!("{base}-{suffix}")
    }
}
