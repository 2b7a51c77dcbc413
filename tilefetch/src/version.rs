//! Product version selection.
//!
//! Catalogs publish human-authored version strings. A caller asks either for
//! an exact version, which must appear literally among the candidates, or
//! for a regex, in which case the highest matching candidate under semver
//! ordering wins. Candidates that match the regex but do not parse as a
//! version are skipped with a warning rather than failing the selection.

use regex::Regex;
use semver::Version;

use crate::error::{join_or_none, FetchError, FetchResult};

/// How the caller identifies the wanted product version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    /// A version string that must be listed verbatim.
    Exact(String),
    /// A regex; the highest matching semver is selected.
    Regex(String),
}

impl VersionSpec {
    /// Build a spec from optional CLI-style inputs.
    ///
    /// A non-empty regex takes precedence over an exact version. Returns
    /// `None` when both are empty.
    pub fn from_options(exact: Option<&str>, regex: Option<&str>) -> Option<Self> {
        match (regex.filter(|r| !r.is_empty()), exact.filter(|e| !e.is_empty())) {
            (Some(regex), _) => Some(Self::Regex(regex.to_string())),
            (None, Some(exact)) => Some(Self::Exact(exact.to_string())),
            (None, None) => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Exact(v) => format!("product version {:?}", v),
            Self::Regex(r) => format!("product version regex {:?}", r),
        }
    }
}

/// Pick a version for `slug` out of `candidates`.
///
/// Fails with [`FetchError::BadRegex`] for an invalid regex and with
/// [`FetchError::NoVersionMatch`] (listing every candidate, or `none`) when
/// nothing qualifies.
pub fn select_version(slug: &str, candidates: &[String], spec: &VersionSpec) -> FetchResult<String> {
    let selected = match spec {
        VersionSpec::Regex(pattern) => latest_matching(candidates, pattern)?,
        VersionSpec::Exact(exact) => candidates.iter().find(|c| *c == exact).cloned(),
    };

    selected.ok_or_else(|| FetchError::NoVersionMatch {
        slug: slug.to_string(),
        requested: spec.describe(),
        existing: join_or_none(candidates),
    })
}

fn latest_matching(candidates: &[String], pattern: &str) -> FetchResult<Option<String>> {
    let re = Regex::new(pattern).map_err(|source| FetchError::BadRegex {
        regex: pattern.to_string(),
        source,
    })?;

    let mut parsed: Vec<(Version, &String)> = Vec::new();
    for candidate in candidates.iter().filter(|c| re.is_match(c)) {
        match parse_lenient(candidate) {
            Some(version) => parsed.push((version, candidate)),
            None => {
                tracing::warn!(version = %candidate, "could not parse semver version, skipping");
            }
        }
    }

    // Stable sort keeps listing order between equal versions such as "1.2" and "1.2.0".
    parsed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(parsed.pop().map(|(_, original)| original.clone()))
}

/// Parse a version string, tolerating a leading `v` and missing minor or
/// patch components (`"2"` and `"2.1"` read as `2.0.0` and `2.1.0`).
pub fn parse_lenient(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }

    let split_at = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split_at);
    let components: Vec<&str> = core.split('.').collect();
    if components.is_empty()
        || components.len() > 3
        || components
            .iter()
            .any(|c| c.is_empty() || !c.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }

    let mut padded: Vec<String> = components
        .iter()
        .map(|c| c.trim_start_matches('0'))
        .map(|c| if c.is_empty() { "0".to_string() } else { c.to_string() })
        .collect();
    while padded.len() < 3 {
        padded.push("0".to_string());
    }

    Version::parse(&format!("{}{}", padded.join("."), suffix)).ok()
}
