//! Canonical request hashing: a deterministic digest over the parts of a
//! request a signature must be bound to. Clients compute the same digest
//! and sign it into the `canonical_request_sha256` token claim.

use sha2::Digest;
use std::collections::BTreeMap;

/// The only header participating in the canonical encoding.
pub const SIGNED_HEADERS: &str = "content-type";

/// Compute the canonical SHA-256 of a request, hex-encoded.
///
/// The encoding is
/// `method \n path \n sortedQuery \n canonicalHeaders \n signedHeaders \n SHA256(body)`
/// with the method upper-cased, an empty path normalized to `/`, query keys
/// sorted and values sorted per key, and the content-type header
/// lower-cased, trimmed, and newline-terminated. Query components are used
/// as transmitted, without percent-decoding.
pub fn canonical_request_sha256(
    method: &str,
    path: &str,
    query: Option<&str>,
    content_type: Option<&str>,
    body: &[u8],
) -> String {
    let mut canonical = String::new();

    canonical.push_str(&method.to_ascii_uppercase());
    canonical.push('\n');

    canonical.push_str(if path.is_empty() { "/" } else { path });
    canonical.push('\n');

    canonical.push_str(&sorted_query(query.unwrap_or_default()));
    canonical.push('\n');

    if let Some(content_type) = content_type {
        canonical.push_str(SIGNED_HEADERS);
        canonical.push(':');
        canonical.push_str(content_type.trim().to_ascii_lowercase().as_str());
        canonical.push('\n');
    }
    canonical.push('\n');

    canonical.push_str(SIGNED_HEADERS);
    canonical.push('\n');

    canonical.push_str(&hex_sha256(body));

    hex_sha256(canonical.as_bytes())
}

fn sorted_query(query: &str) -> String {
    let mut pairs: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        pairs.entry(key).or_default().push(value);
    }
    let mut encoded = Vec::new();
    for (key, mut values) in pairs {
        values.sort_unstable();
        for value in values {
            encoded.push(format!("{key}={value}"));
        }
    }
    encoded.join("&")
}

fn hex_sha256(bytes: &[u8]) -> String {
    let digest = sha2::Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
