//! Stemcell resolution.
//!
//! Stemcells advertise `major.minor` versions only; patch rollups ship as new
//! minors within the same major line. A product declaring `97.28` therefore
//! accepts `97.28` and any later `97.x`, but never `98.0` or `96.x`.

use std::cmp::Ordering;

use crate::error::{FetchError, FetchResult};

/// A stemcell product to download: its catalog slug and exact version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemcellDependency {
    pub slug: String,
    pub version: String,
}

impl StemcellDependency {
    pub fn new(slug: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            version: version.into(),
        }
    }
}

/// Map a tile's `stemcell_criteria.os` to the catalog slug of its stemcells.
///
/// Several Windows releases share a single slug.
pub fn slug_for_os(os: &str) -> Option<&'static str> {
    match os {
        "ubuntu-xenial" => Some("stemcells-ubuntu-xenial"),
        "ubuntu-trusty" => Some("stemcells"),
        "ubuntu-bionic" => Some("stemcells-ubuntu-bionic"),
        "ubuntu-jammy" => Some("stemcells-ubuntu-jammy"),
        "windows2016" | "windows1803" | "windows2019" => Some("stemcells-windows-server"),
        _ => None,
    }
}

/// Split a stemcell version into `(major, minor)`.
///
/// `"97"` reads as `(97, 0)`; anything other than one or two numeric
/// components, including three-part semver, is rejected.
pub fn parse_stemcell_version(version: &str) -> FetchResult<(u64, u64)> {
    let malformed = || FetchError::MalformedStemcellVersion {
        version: version.to_string(),
    };

    let parts: Vec<&str> = version.split('.').collect();
    let (major, minor) = match parts.as_slice() {
        [major] => (*major, "0"),
        [major, minor] => (*major, *minor),
        _ => return Err(malformed()),
    };

    let major = major.parse::<u64>().map_err(|_| malformed())?;
    let minor = minor.parse::<u64>().map_err(|_| malformed())?;
    Ok((major, minor))
}

/// Pick the highest version among `versions`.
///
/// Every entry must parse; ties keep the earliest entry.
pub fn latest_version(versions: &[String]) -> FetchResult<Option<String>> {
    let mut best: Option<((u64, u64), &String)> = None;
    for version in versions {
        let parsed = parse_stemcell_version(version)?;
        best = match best {
            Some((current, _)) if parsed.cmp(&current) != Ordering::Greater => best,
            _ => Some((parsed, version)),
        };
    }
    Ok(best.map(|(_, version)| version.clone()))
}

/// Pick the latest stemcell in `available` compatible with `required`.
///
/// Survivors share the required major and have a minor at least as high.
/// Listing entries that do not parse are ignored; a malformed `required`
/// fails with [`FetchError::MalformedStemcellVersion`].
pub fn latest_compatible(slug: &str, required: &str, available: &[String]) -> FetchResult<String> {
    let (required_major, required_minor) = parse_stemcell_version(required)?;

    let compatible: Vec<String> = available
        .iter()
        .filter(|candidate| match parse_stemcell_version(candidate) {
            Ok((major, minor)) => major == required_major && minor >= required_minor,
            Err(_) => {
                tracing::debug!(version = %candidate, "ignoring unparseable stemcell version");
                false
            }
        })
        .cloned()
        .collect();

    latest_version(&compatible)?.ok_or_else(|| FetchError::NoCompatibleStemcell {
        slug: slug.to_string(),
        version: required.to_string(),
        reason: format!("available versions: {}", crate::error::join_or_none(available)),
    })
}
