// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! Canonicalizes and validates forge repository URLs.
//!
//! A canonical URL is the natural key for a tracked [`Repository`](../archiver_core)
//! row: two inputs that normalize to the same canonical form must be treated
//! as the same repository.

use std::fmt;

use thiserror::Error;
use url::Url;

/// The only forge host this build of the canonicalizer accepts. Tests that
/// need a different host use [`canonicalize_for_host`].
pub const DEFAULT_HOST: &str = "github.com";

/// A validated, normalized repository URL plus its extracted owner/name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Canonical {
    url: String,
    owner: String,
    name: String,
}

impl Canonical {
    /// The normalized URL string, e.g. `https://github.com/octocat/hello-world`.
    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Canonical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CanonError {
    #[error("url contains whitespace")]
    Whitespace,
    #[error("url could not be parsed")]
    Unparseable,
    #[error("unsupported scheme, only http/https are accepted")]
    UnsupportedScheme,
    #[error("unsupported host, expected {expected}")]
    UnsupportedHost { expected: &'static str },
    #[error("expected exactly two path segments (owner/name), found {found}")]
    WrongSegmentCount { found: usize },
    #[error("owner/name segment is empty")]
    EmptySegment,
    #[error("owner/name segment contains a percent-encoded character")]
    PercentEncoded,
    #[error("owner/name segment contains a character outside [A-Za-z0-9._-]")]
    InvalidCharacter,
    #[error("normalization did not reach a fixed point")]
    NotFixedPoint,
}

/// Canonicalize against [`DEFAULT_HOST`].
pub fn canonicalize(input: &str) -> Result<Canonical, CanonError> {
    canonicalize_for_host(input, DEFAULT_HOST)
}

/// Canonicalize against an explicitly supplied forge host.
///
/// `expected_host` is compared case-insensitively and without a leading
/// `www.`, mirroring the normalization applied to the input itself.
pub fn canonicalize_for_host(input: &str, expected_host: &'static str) -> Result<Canonical, CanonError> {
    let canonical = canonicalize_once(input, expected_host)?;

    // Defense against inputs that only look stable: re-run the full pipeline
    // on our own output and require it to reproduce exactly. A string whose
    // meaning shifts under a second normalization pass (e.g. a component
    // that only decodes percent-escapes on the first pass) is rejected
    // rather than silently accepted.
    let refolded = canonicalize_once(&canonical.url, expected_host)?;
    if refolded.url != canonical.url || refolded.owner != canonical.owner || refolded.name != canonical.name {
        return Err(CanonError::NotFixedPoint);
    }

    Ok(canonical)
}

fn canonicalize_once(input: &str, expected_host: &'static str) -> Result<Canonical, CanonError> {
    if input.chars().any(|c| c.is_whitespace()) {
        return Err(CanonError::Whitespace);
    }

    let with_scheme = if input.contains("://") {
        input.to_owned()
    } else {
        format!("https://{input}")
    };

    let parsed = Url::parse(&with_scheme).map_err(|_| CanonError::Unparseable)?;

    match parsed.scheme() {
        "http" | "https" => {}
        _ => return Err(CanonError::UnsupportedScheme),
    }

    let host = parsed.host_str().ok_or(CanonError::Unparseable)?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host != expected_host {
        return Err(CanonError::UnsupportedHost { expected: expected_host });
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|segs| segs.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    if segments.len() != 2 {
        return Err(CanonError::WrongSegmentCount { found: segments.len() });
    }

    let owner = validate_segment(segments[0])?;
    let name = validate_segment(strip_git_suffix(segments[1]))?;

    let url = format!("https://{expected_host}/{owner}/{name}");

    Ok(Canonical {
        url,
        owner: owner.to_owned(),
        name: name.to_owned(),
    })
}

fn strip_git_suffix(segment: &str) -> &str {
    segment.strip_suffix(".git").unwrap_or(segment)
}

/// Whether `segment` obeys the owner/name character class (ASCII letters,
/// digits, hyphen, underscore, period; non-empty; no percent-encoding).
/// Exposed for callers that must validate an owner/name pair before
/// substituting it into a query string (e.g. the forge API client,
/// defending against GraphQL-injection) without going through full URL
/// canonicalization.
pub fn is_valid_owner_or_name_segment(segment: &str) -> bool {
    validate_segment(segment).is_ok()
}

fn validate_segment(segment: &str) -> Result<&str, CanonError> {
    if segment.is_empty() {
        return Err(CanonError::EmptySegment);
    }
    if segment.contains('%') {
        return Err(CanonError::PercentEncoded);
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CanonError::InvalidCharacter);
    }
    Ok(segment)
}
