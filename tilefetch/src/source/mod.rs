//! Artifact sources.
//!
//! A source knows where product files live and how to get them onto disk.
//! Everything above this module is written against [`ArtifactSource`]; the
//! catalog and blob backends share no implementation.
//!
//! # Architecture
//!
//! ```text
//! ArtifactSource (trait)
//!     │
//!     ├── CatalogSource ── CatalogClient ── TokenSource
//!     │         └── RangedDownloader (fresh signed link per refresh)
//!     │
//!     └── BlobSource ── BlobStore (trait)
//!                           ├── LocalBlobStore
//!                           └── S3BlobStore
//! ```

use std::path::Path;

use glob::Pattern;

use crate::download::ProgressMeter;
use crate::error::{join_or_none, FetchError, FetchResult};
use crate::stemcell::StemcellDependency;
use crate::tile::TileMetadata;

pub mod blob;
pub mod catalog;

pub use blob::{BlobFile, BlobSource};
pub use catalog::{CatalogFile, CatalogSource};

/// A single downloadable file, as located by the source that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    Catalog(CatalogFile),
    Blob(BlobFile),
}

impl ArtifactRef {
    /// The name the source knows the file by.
    pub fn name(&self) -> &str {
        match self {
            Self::Catalog(file) => &file.object_key,
            Self::Blob(file) => &file.key,
        }
    }

    /// Last path component of [`name`](Self::name).
    pub fn file_name(&self) -> &str {
        base_name(self.name())
    }

    /// Declared SHA-256, when the source publishes one.
    pub fn sha256(&self) -> Option<&str> {
        match self {
            Self::Catalog(file) => file.sha256.as_deref(),
            Self::Blob(_) => None,
        }
    }

    /// Short tag of the producing backend.
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Catalog(_) => "catalog",
            Self::Blob(_) => "blob",
        }
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.backend())
    }
}

/// Capabilities every backend provides.
pub trait ArtifactSource: Send + Sync {
    /// Identifier used in messages.
    fn name(&self) -> &str;

    /// Product versions available for `slug`.
    fn list_versions(&self, slug: &str) -> FetchResult<Vec<String>>;

    /// The one file of release `(slug, version)` whose base name matches `glob`.
    fn resolve_file(&self, slug: &str, version: &str, glob: &str) -> FetchResult<ArtifactRef>;

    /// Write the artifact's bytes into `destination`.
    ///
    /// `meter` is advanced as bytes arrive and has its total set once known.
    fn download(&self, artifact: &ArtifactRef, destination: &Path, meter: &ProgressMeter) -> FetchResult<()>;

    /// The latest stemcell compatible with a downloaded product.
    ///
    /// `slug_hint` picks one stemcell product when several qualify.
    fn stemcell_for(
        &self,
        artifact: &ArtifactRef,
        downloaded: &Path,
        slug_hint: Option<&str>,
    ) -> FetchResult<StemcellDependency>;

    /// Read the tile metadata of an artifact without downloading it.
    fn tile_metadata(&self, artifact: &ArtifactRef) -> FetchResult<TileMetadata>;
}

pub(crate) fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

pub(crate) fn compile_glob(glob: &str) -> FetchResult<Pattern> {
    Pattern::new(glob).map_err(|e| FetchError::Config(format!("invalid file glob '{}': {}", glob, e)))
}

/// Reduce glob matches to exactly one.
///
/// `matches` pairs each match's display name with its value; `available`
/// lists what was searched when nothing matched.
pub(crate) fn single_match<T>(glob: &str, mut matches: Vec<(String, T)>, available: &[String]) -> FetchResult<T> {
    match matches.len() {
        0 => Err(FetchError::NoFileMatch {
            glob: glob.to_string(),
            available: join_or_none(available),
        }),
        1 => Ok(matches.remove(0).1),
        _ => Err(FetchError::Ambiguous {
            glob: glob.to_string(),
            candidates: matches.into_iter().map(|(name, _)| name).collect(),
        }),
    }
}
