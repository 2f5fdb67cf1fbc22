//! URL canonicalization and deterministic job identity.
//!
//! The canonical form of a URL is what deduplication and job identity are
//! keyed on, so [`canonicalize`] must be idempotent and [`job_id`] must be a
//! pure function of its inputs.

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{RegTruthError, Result};

/// Number of hex characters of the URL hash kept in a job ID.
pub const JOB_HASH_LEN: usize = 16;

/// Exact query keys that only carry click/campaign tracking.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "gbraid", "wbraid", "msclkid", "mc_cid", "mc_eid", "_ga", "_gl",
    "yclid", "igshid", "ref_src",
];

/// Query key prefixes that only carry tracking.
const TRACKING_PREFIXES: &[&str] = &["utm_", "pk_", "mtm_"];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    TRACKING_PARAMS.contains(&key.as_str())
        || TRACKING_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Canonicalize a URL: strip tracking params, sort the rest, drop the
/// fragment, lowercase scheme/host and drop a trailing slash (except root).
pub fn canonicalize(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim())
        .map_err(|e| RegTruthError::validation(format!("invalid URL '{raw}': {e}")))?;
    Ok(canonicalize_url(&url))
}

/// Canonicalize an already-parsed URL. Host case and default ports are
/// normalized by the `url` crate itself.
pub fn canonicalize_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    url.to_string()
}

/// Deterministic job identity: `source + ":" + hash(canonicalize(url))`.
///
/// Equal inputs yield equal IDs across process restarts; queue-level
/// deduplication depends on it.
pub fn job_id(source: &str, url: &str) -> Result<String> {
    let canonical = canonicalize(url)?;
    Ok(job_id_for_canonical(source, &canonical))
}

/// Job ID for a URL that is already in canonical form.
pub fn job_id_for_canonical(source: &str, canonical: &str) -> String {
    let digest = sha256_hex(canonical.as_bytes());
    format!("{source}:{}", &digest[..JOB_HASH_LEN])
}

/// Full SHA-256 hex digest of arbitrary bytes (content hashes).
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Lowercased host of a URL, used as the rate-limiting key.
pub fn domain_of(raw: &str) -> Option<String> {
    Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}
