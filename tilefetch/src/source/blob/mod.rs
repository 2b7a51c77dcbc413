//! Blob backend.
//!
//! Mirrored artifacts are stored under the naming convention
//! `(<path>/)?[<slug>,<version>]<file name>`, with products and stemcells
//! optionally kept under separate paths. The store itself is a plain
//! namespace; all knowledge of the convention lives here.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::download::{
    ensure_space, space_check_path, DiskSpace, DownloadSettings, ProgressMeter, RangeTransport, RangedDownloader,
    StaticUrl, StatvfsDiskSpace,
};
use crate::error::{FetchError, FetchResult};
use crate::source::{base_name, compile_glob, single_match, ArtifactRef, ArtifactSource};
use crate::stemcell::{latest_compatible, slug_for_os, StemcellDependency};
use crate::tile::{extract_metadata, read_tile_metadata, TileMetadata};

mod credentials;
mod s3;
mod sigv4;
mod store;

pub use credentials::{
    credentials_provider, CredentialsProvider, InstanceRoleCredentials, S3AuthType, S3Credentials,
    DEFAULT_METADATA_ENDPOINT,
};
pub use s3::S3BlobStore;
pub use sigv4::{SigV4Signer, DEFAULT_REGION};
pub use store::{BlobStore, LocalBlobStore, ReadSeek};

/// Buffer size for streaming objects to disk (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// An object located in a blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobFile {
    /// Full object key, including path and `[slug,version]` prefix.
    pub key: String,
}

fn prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\[[^\]]*\]").unwrap())
}

/// A file name with any leading `[slug,version]` removed.
pub fn strip_blob_prefix(file_name: &str) -> &str {
    match prefix_pattern().find(file_name) {
        Some(prefix) => &file_name[prefix.end()..],
        None => file_name,
    }
}

/// The `[slug,version]` prefix for a file name.
pub fn blob_prefix(slug: &str, version: &str) -> String {
    format!("[{},{}]", slug, version)
}

fn compile(pattern: String) -> FetchResult<Regex> {
    Regex::new(&pattern).map_err(|source| FetchError::BadRegex { regex: pattern, source })
}

/// [`ArtifactSource`] over a [`BlobStore`].
pub struct BlobSource {
    store: Arc<dyn BlobStore>,
    product_path: String,
    stemcell_path: String,
    settings: DownloadSettings,
    disk: Arc<dyn DiskSpace>,
    transport: Option<Arc<dyn RangeTransport>>,
}

impl BlobSource {
    pub fn new(store: Arc<dyn BlobStore>, settings: DownloadSettings) -> Self {
        Self {
            store,
            product_path: String::new(),
            stemcell_path: String::new(),
            settings,
            disk: Arc::new(StatvfsDiskSpace),
            transport: None,
        }
    }

    /// Directory holding products.
    pub fn with_product_path(mut self, path: impl Into<String>) -> Self {
        self.product_path = path.into();
        self
    }

    /// Directory holding stemcells.
    pub fn with_stemcell_path(mut self, path: impl Into<String>) -> Self {
        self.stemcell_path = path.into();
        self
    }

    /// Download through the ranged engine when the store exposes URLs.
    pub fn with_transport(mut self, transport: Arc<dyn RangeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the free-space query used before downloads.
    pub fn with_disk_space(mut self, disk: Arc<dyn DiskSpace>) -> Self {
        self.disk = disk;
        self
    }

    fn list_keys(&self) -> FetchResult<Vec<String>> {
        let keys = self.store.list_keys()?;
        if keys.is_empty() {
            return Err(FetchError::EmptyStore {
                store: self.store.name(),
            });
        }
        Ok(keys)
    }

    /// Versions of `slug` stored under `path`, in listing order without duplicates.
    fn versions_at(&self, slug: &str, path: &str) -> FetchResult<Vec<String>> {
        let pattern = compile(format!(
            r"^/?{}/?\[{},(.*?)\]",
            regex::escape(path.trim_matches('/')),
            regex::escape(slug)
        ))?;

        let mut versions: Vec<String> = Vec::new();
        for key in self.list_keys()? {
            if let Some(version) = pattern.captures(&key).and_then(|c| c.get(1)) {
                if !versions.iter().any(|v| v == version.as_str()) {
                    versions.push(version.as_str().to_string());
                }
            }
        }

        if versions.is_empty() {
            return Err(FetchError::NoSlugFiles {
                store: self.store.name(),
                slug: slug.to_string(),
            });
        }
        Ok(versions)
    }

    fn blob_file<'a>(&self, artifact: &'a ArtifactRef) -> FetchResult<&'a BlobFile> {
        match artifact {
            ArtifactRef::Blob(file) => Ok(file),
            other => Err(FetchError::UnsupportedArtifact {
                backend: self.name().to_string(),
                artifact: other.to_string(),
            }),
        }
    }

    fn stream(&self, key: &str, destination: &Path, meter: &ProgressMeter) -> FetchResult<u64> {
        let size = self.store.size(key)?;
        ensure_space(self.disk.as_ref(), &space_check_path(destination), size)?;
        meter.set_total(size);

        let mut reader = self.store.open(key)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(destination)
            .map_err(|e| FetchError::io("could not open", destination, e))?;

        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            if self.settings.cancel.is_cancelled() {
                return Err(FetchError::Cancelled { url: key.to_string() });
            }
            let n = reader
                .read(&mut buffer)
                .map_err(|e| FetchError::io("could not read", key, e))?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])
                .map_err(|e| FetchError::io("could not write", destination, e))?;
            written += n as u64;
            meter.add(n as u64);
        }
        file.flush()
            .map_err(|e| FetchError::io("could not write", destination, e))?;
        Ok(written)
    }
}

impl ArtifactSource for BlobSource {
    fn name(&self) -> &str {
        "blob"
    }

    fn list_versions(&self, slug: &str) -> FetchResult<Vec<String>> {
        self.versions_at(slug, &self.product_path)
    }

    fn resolve_file(&self, slug: &str, version: &str, glob: &str) -> FetchResult<ArtifactRef> {
        let valid = compile(format!(
            r"^/?({}|{})/?\[{},{}\]",
            regex::escape(self.product_path.trim_matches('/')),
            regex::escape(self.stemcell_path.trim_matches('/')),
            regex::escape(slug),
            regex::escape(version)
        ))?;

        let prefixed: Vec<String> = self.list_keys()?.into_iter().filter(|key| valid.is_match(key)).collect();
        if prefixed.is_empty() {
            return Err(FetchError::NoPrefixedFiles {
                store: self.store.name(),
                slug: slug.to_string(),
                version: version.to_string(),
            });
        }

        let pattern = compile_glob(glob)?;
        let matches = prefixed
            .iter()
            .filter(|key| pattern.matches(strip_blob_prefix(base_name(key))))
            .map(|key| (key.clone(), key.clone()))
            .collect();
        let key = single_match(glob, matches, &prefixed)?;

        tracing::debug!(slug, version, key = %key, "resolved blob");
        Ok(ArtifactRef::Blob(BlobFile { key }))
    }

    fn download(&self, artifact: &ArtifactRef, destination: &Path, meter: &ProgressMeter) -> FetchResult<()> {
        let file = self.blob_file(artifact)?;

        let ranged = self
            .transport
            .as_ref()
            .and_then(|transport| self.store.download_url(&file.key).map(|url| (transport.clone(), url)));

        let bytes = match ranged {
            Some((transport, url)) => {
                let downloader =
                    RangedDownloader::new(transport, self.settings.clone()).with_disk_space(self.disk.clone());
                downloader.download(&StaticUrl::new(url), destination, meter)?.content_length
            }
            None => self.stream(&file.key, destination, meter)?,
        };

        tracing::info!(store = %self.store.name(), key = %file.key, bytes, "downloaded blob");
        Ok(())
    }

    fn stemcell_for(
        &self,
        _artifact: &ArtifactRef,
        downloaded: &Path,
        slug_hint: Option<&str>,
    ) -> FetchResult<StemcellDependency> {
        let metadata = read_tile_metadata(downloaded)?;
        let criteria = metadata.require_stemcell_criteria()?;

        let slug = match slug_hint {
            Some(hint) => hint.to_string(),
            None => slug_for_os(&criteria.os)
                .ok_or_else(|| FetchError::NoCompatibleStemcell {
                    slug: criteria.os.clone(),
                    version: criteria.version.clone(),
                    reason: format!("no known stemcell product for os {:?}", criteria.os),
                })?
                .to_string(),
        };

        let available = self.versions_at(&slug, &self.stemcell_path)?;
        let version = latest_compatible(&slug, &criteria.version, &available)?;
        tracing::info!(slug = %slug, version = %version, "selected stemcell");
        Ok(StemcellDependency::new(slug, version))
    }

    fn tile_metadata(&self, artifact: &ArtifactRef) -> FetchResult<TileMetadata> {
        let file = self.blob_file(artifact)?;
        let reader = self.store.open_seekable(&file.key)?;
        extract_metadata(reader, &file.key)
    }
}
