//! Tile metadata extraction.
//!
//! A tile is a ZIP archive carrying one YAML document at
//! `metadata/<name>.yml` in the archive root (some packagers store it as
//! `./metadata/<name>.yml`). Only the product name, the
//! product version and the stemcell criteria are interpreted; the raw bytes
//! are kept for callers that need the rest.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Deserializer};

use super::range_reader::HttpRangeReader;
use crate::download::RangeTransport;
use crate::error::{FetchError, FetchResult};

/// The base image a tile requires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StemcellCriteria {
    pub os: String,
    /// `major` or `major.minor`.
    pub version: String,
    pub enable_patch_security_updates: bool,
}

/// Interpreted contents of a tile's metadata document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileMetadata {
    pub name: String,
    pub product_version: String,
    /// `None` when the tile declares no stemcell.
    pub stemcell_criteria: Option<StemcellCriteria>,
    /// Archive path of the metadata document.
    pub entry_name: String,
    /// The metadata document as stored in the tile.
    pub raw: Vec<u8>,
}

impl TileMetadata {
    /// The stemcell criteria, failing when the tile declares none.
    pub fn require_stemcell_criteria(&self) -> FetchResult<&StemcellCriteria> {
        self.stemcell_criteria
            .as_ref()
            .ok_or_else(|| FetchError::MetadataIncomplete {
                source_name: self.name.clone(),
                reason: "no stemcell_criteria declared".to_string(),
            })
    }
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    #[serde(default, deserialize_with = "scalar_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    product_version: Option<String>,
    #[serde(default)]
    stemcell_criteria: Option<RawStemcellCriteria>,
}

#[derive(Debug, Deserialize)]
struct RawStemcellCriteria {
    #[serde(default, deserialize_with = "scalar_string")]
    os: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    version: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    enable_patch_security_updates: Option<String>,
}

/// Accept strings, numbers and booleans; authors leave versions unquoted.
fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_yaml::Value::String(s)) => Some(s),
        Some(serde_yaml::Value::Number(n)) => Some(n.to_string()),
        Some(serde_yaml::Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

fn metadata_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\./)?metadata/[^/]+\.yml$").unwrap())
}

/// Whether an archive entry is the tile's metadata document.
///
/// Only `metadata/*.yml` at the archive root qualifies, optionally written as
/// `./metadata/*.yml`; `__MACOSX/metadata/x.yml`
/// and `metadata/nested/x.yml` do not.
pub fn is_metadata_entry(name: &str) -> bool {
    metadata_pattern().is_match(name)
}

/// Parse a metadata document.
pub fn parse_metadata(raw: Vec<u8>, entry_name: &str, source_name: &str) -> FetchResult<TileMetadata> {
    let incomplete = |reason: String| FetchError::MetadataIncomplete {
        source_name: source_name.to_string(),
        reason,
    };

    let parsed: RawMetadata = serde_yaml::from_slice(&raw)
        .map_err(|e| incomplete(format!("could not parse {}: {}", entry_name, e)))?;

    let name = parsed
        .name
        .filter(|s| !s.is_empty())
        .ok_or_else(|| incomplete("missing name".to_string()))?;
    let product_version = parsed
        .product_version
        .filter(|s| !s.is_empty())
        .ok_or_else(|| incomplete("missing product_version".to_string()))?;

    let stemcell_criteria = match parsed.stemcell_criteria {
        None => None,
        Some(criteria) => {
            let os = criteria
                .os
                .filter(|s| !s.is_empty())
                .ok_or_else(|| incomplete("missing stemcell_criteria.os".to_string()))?;
            let version = criteria
                .version
                .filter(|s| !s.is_empty())
                .ok_or_else(|| incomplete("missing stemcell_criteria.version".to_string()))?;
            let enable_patch_security_updates = criteria
                .enable_patch_security_updates
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));
            Some(StemcellCriteria {
                os,
                version,
                enable_patch_security_updates,
            })
        }
    };

    Ok(TileMetadata {
        name,
        product_version,
        stemcell_criteria,
        entry_name: entry_name.to_string(),
        raw,
    })
}

/// Extract the metadata from a tile readable through `reader`.
pub fn extract_metadata<R: Read + Seek>(reader: R, source_name: &str) -> FetchResult<TileMetadata> {
    let invalid = |reason: String| FetchError::InvalidTile {
        source_name: source_name.to_string(),
        reason,
    };

    let mut archive = zip::ZipArchive::new(reader).map_err(|e| {
        invalid(format!(
            "could not parse tile. Ensure that the file is a valid pivotal tile: {}",
            e
        ))
    })?;

    let entry_name = archive
        .file_names()
        .find(|name| is_metadata_entry(name))
        .map(str::to_string)
        .ok_or_else(|| invalid("no metadata/*.yml document found".to_string()))?;

    let mut entry = archive
        .by_name(&entry_name)
        .map_err(|e| invalid(format!("could not open {}: {}", entry_name, e)))?;
    let mut raw = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut raw)
        .map_err(|e| invalid(format!("could not read {}: {}", entry_name, e)))?;

    tracing::debug!(source = source_name, entry = %entry_name, bytes = raw.len(), "read tile metadata");
    parse_metadata(raw, &entry_name, source_name)
}

/// Extract the metadata from a tile on disk.
pub fn read_tile_metadata(path: &Path) -> FetchResult<TileMetadata> {
    let file = File::open(path).map_err(|e| FetchError::io("could not open", path, e))?;
    extract_metadata(BufReader::new(file), &path.display().to_string())
}

/// Extract the metadata from a tile served over HTTP without downloading it.
pub fn fetch_tile_metadata(
    transport: Arc<dyn RangeTransport>,
    url: &str,
    referer: &str,
) -> FetchResult<TileMetadata> {
    let mut reader = HttpRangeReader::open(transport, url, referer)?;
    let metadata = extract_metadata(&mut reader, url)?;
    tracing::debug!(
        url,
        tile_size = reader.len(),
        bytes_fetched = reader.bytes_fetched(),
        "read tile metadata over HTTP"
    );
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    const METADATA: &str = r#"---
name: example-product
product_version: 1.0-build.0
stemcell_criteria:
  os: ubuntu-xenial
  version: "97.28"
  enable_patch_security_updates: true
"#;

    fn tile(entries: &[(&str, &str)]) -> Cursor<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        let mut cursor = writer.finish().unwrap();
        cursor.set_position(0);
        cursor
    }

    #[test]
    fn test_extracts_fields() {
        let metadata = extract_metadata(tile(&[("metadata/example.yml", METADATA)]), "tile").unwrap();

        assert_eq!(metadata.name, "example-product");
        assert_eq!(metadata.product_version, "1.0-build.0");
        assert_eq!(metadata.entry_name, "metadata/example.yml");
        assert_eq!(metadata.raw, METADATA.as_bytes());
        assert_eq!(
            metadata.stemcell_criteria,
            Some(StemcellCriteria {
                os: "ubuntu-xenial".to_string(),
                version: "97.28".to_string(),
                enable_patch_security_updates: true,
            })
        );
    }

    #[test]
    fn test_nested_metadata_is_ignored() {
        let archive = tile(&[
            ("__MACOSX/metadata/example.yml", "name: wrong"),
            ("releases/metadata/x.yml", "name: wrong"),
            ("metadata/example.yml", METADATA),
        ]);
        let metadata = extract_metadata(archive, "tile").unwrap();
        assert_eq!(metadata.name, "example-product");
    }

    #[test]
    fn test_dot_slash_entry_is_found() {
        let metadata = extract_metadata(tile(&[("./metadata/some-product.yml", METADATA)]), "tile").unwrap();
        assert_eq!(metadata.entry_name, "./metadata/some-product.yml");
        assert_eq!(metadata.product_version, "1.0-build.0");
    }

    #[test]
    fn test_missing_metadata_is_invalid_tile() {
        let err = extract_metadata(tile(&[("__MACOSX/metadata/example.yml", METADATA)]), "tile")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTile);
    }

    #[test]
    fn test_not_a_zip() {
        let err = extract_metadata(Cursor::new(b"definitely not a zip".to_vec()), "tile").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTile);
    }

    #[test]
    fn test_missing_name_is_incomplete() {
        let err = parse_metadata(b"product_version: 1.0\n".to_vec(), "metadata/x.yml", "tile").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataIncomplete);
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_empty_version_is_incomplete() {
        let err = parse_metadata(
            b"name: p\nproduct_version: \"\"\n".to_vec(),
            "metadata/x.yml",
            "tile",
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataIncomplete);
    }

    #[test]
    fn test_partial_stemcell_criteria_is_incomplete() {
        let yaml = "name: p\nproduct_version: '1.0'\nstemcell_criteria:\n  os: ubuntu-xenial\n";
        let err = parse_metadata(yaml.as_bytes().to_vec(), "metadata/x.yml", "tile").unwrap_err();
        assert!(err.to_string().contains("stemcell_criteria.version"));
    }

    #[test]
    fn test_unquoted_numbers_are_accepted() {
        let yaml = "name: p\nproduct_version: 2.5\nstemcell_criteria:\n  os: windows2019\n  version: 2019\n";
        let metadata = parse_metadata(yaml.as_bytes().to_vec(), "metadata/x.yml", "tile").unwrap();
        assert_eq!(metadata.product_version, "2.5");
        let criteria = metadata.require_stemcell_criteria().unwrap();
        assert_eq!(criteria.version, "2019");
        assert!(!criteria.enable_patch_security_updates);
    }

    #[test]
    fn test_no_stemcell_criteria() {
        let metadata = parse_metadata(b"name: p\nproduct_version: '1'\n".to_vec(), "m", "tile").unwrap();
        assert!(metadata.stemcell_criteria.is_none());
        assert_eq!(
            metadata.require_stemcell_criteria().unwrap_err().kind(),
            ErrorKind::MetadataIncomplete
        );
    }

    #[test]
    fn test_metadata_entry_pattern() {
        assert!(is_metadata_entry("metadata/p.yml"));
        assert!(is_metadata_entry("./metadata/p.yml"));
        assert!(!is_metadata_entry("../metadata/p.yml"));
        assert!(!is_metadata_entry("./sub/metadata/p.yml"));
        assert!(!is_metadata_entry("metadata/p.yaml"));
        assert!(!is_metadata_entry("metadata/sub/p.yml"));
        assert!(!is_metadata_entry("__MACOSX/metadata/p.yml"));
    }

    #[test]
    fn test_read_tile_metadata_from_disk() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("product.pivotal");
        std::fs::write(&path, tile(&[("metadata/example.yml", METADATA)]).into_inner()).unwrap();

        let metadata = read_tile_metadata(&path).unwrap();
        assert_eq!(metadata.name, "example-product");
    }
}
