//! End-to-end acquisition of a product and its stemcell.
//!
//! ```text
//! list_versions ──> select_version ──> resolve_file ──> download (.partial)
//!                                                          │
//!                                          verify sha256 ──┤──> rename
//!                                                          ▼
//!                      stemcell_for ──> resolve_file (light, then heavy) ──> download
//! ```
//!
//! Files already present in the output directory are not downloaded again.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::download::{verify_checksum, ProgressCallback, ProgressMeter, ProgressReporter};
use crate::error::{FetchError, FetchResult};
use crate::source::blob::{blob_prefix, strip_blob_prefix};
use crate::source::{compile_glob, ArtifactRef, ArtifactSource};
use crate::tile::read_tile_metadata;
use crate::version::{select_version, VersionSpec};

/// Name of the summary written to the output directory.
pub const DOWNLOAD_FILE_NAME: &str = "download-file.json";

/// Name of the product/stemcell pairing written when a stemcell was fetched.
pub const ASSIGN_STEMCELL_FILE_NAME: &str = "assign-stemcell.yml";

/// Builds a progress callback for the file about to be downloaded.
pub type ProgressFactory = Arc<dyn Fn(&str) -> ProgressCallback + Send + Sync>;

/// Which stemcell to fetch alongside the product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemcellRequest {
    /// IaaS portion of the stemcell file name, e.g. `aws`.
    pub iaas: String,
    /// Use this version instead of the latest compatible one.
    pub version: Option<String>,
    /// Only accept full (non-light) stemcells.
    pub heavy: bool,
    /// Stemcell product slug, when several qualify.
    pub slug: Option<String>,
    /// Where to put the stemcell; defaults to the product's directory.
    pub output_dir: Option<PathBuf>,
}

impl StemcellRequest {
    pub fn new(iaas: impl Into<String>) -> Self {
        Self {
            iaas: iaas.into(),
            version: None,
            heavy: false,
            slug: None,
            output_dir: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_heavy(mut self, heavy: bool) -> Self {
        self.heavy = heavy;
        self
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Stemcell file globs in order of preference.
    pub fn globs(&self) -> Vec<String> {
        let heavy = format!("bosh*{}*", self.iaas);
        if self.heavy {
            vec![heavy]
        } else {
            vec![format!("light*bosh*{}*", self.iaas), heavy]
        }
    }
}

/// What to acquire and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest {
    pub slug: String,
    pub version: VersionSpec,
    pub file_glob: String,
    pub output_dir: PathBuf,
    /// Prefix local file names with `[slug,version]`.
    pub blob_prefix: bool,
    /// Remove older files matching the glob from the output directory.
    pub cleanup_cache: bool,
    pub stemcell: Option<StemcellRequest>,
}

impl AcquireRequest {
    pub fn new(
        slug: impl Into<String>,
        version: VersionSpec,
        file_glob: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            slug: slug.into(),
            version,
            file_glob: file_glob.into(),
            output_dir: output_dir.into(),
            blob_prefix: false,
            cleanup_cache: false,
            stemcell: None,
        }
    }

    pub fn with_blob_prefix(mut self, enabled: bool) -> Self {
        self.blob_prefix = enabled;
        self
    }

    pub fn with_cleanup_cache(mut self, enabled: bool) -> Self {
        self.cleanup_cache = enabled;
        self
    }

    pub fn with_stemcell(mut self, stemcell: StemcellRequest) -> Self {
        self.stemcell = Some(stemcell);
        self
    }

    /// Check the request before any network traffic.
    pub fn validate(&self) -> FetchResult<()> {
        if self.file_glob.is_empty() {
            return Err(FetchError::Config("a file glob is required".to_string()));
        }
        compile_glob(&self.file_glob)?;
        require_dir("output directory", &self.output_dir)?;
        if let Some(dir) = self.stemcell.as_ref().and_then(|s| s.output_dir.as_ref()) {
            require_dir("stemcell output directory", dir)?;
        }
        Ok(())
    }
}

fn require_dir(what: &str, dir: &Path) -> FetchResult<()> {
    match fs::metadata(dir) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(FetchError::Config(format!("{} {:?} is not a directory", what, dir))),
        Err(e) => Err(FetchError::Config(format!("{} {:?} does not exist: {}", what, dir, e))),
    }
}

/// Pairing of a product with the stemcell it should be deployed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignStemcell {
    pub product: String,
    pub stemcell: String,
}

/// Files produced by an acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireOutcome {
    pub product_path: PathBuf,
    pub product_slug: String,
    pub product_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stemcell_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stemcell_version: Option<String>,
    #[serde(skip)]
    pub assign_stemcell: Option<AssignStemcell>,
}

impl AcquireOutcome {
    /// Write `download-file.json`, and `assign-stemcell.yml` when a stemcell
    /// was acquired, into `dir`. Returns the paths written.
    pub fn write_to(&self, dir: &Path) -> FetchResult<Vec<PathBuf>> {
        let mut written = vec![write_json(&dir.join(DOWNLOAD_FILE_NAME), self)?];
        if let Some(assign) = &self.assign_stemcell {
            written.push(write_yaml(&dir.join(ASSIGN_STEMCELL_FILE_NAME), assign)?);
        }
        Ok(written)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> FetchResult<PathBuf> {
    let file = File::create(path).map_err(|e| FetchError::io("could not create", path, e))?;
    serde_json::to_writer(file, value).map_err(|e| FetchError::io("could not write", path, e.into()))?;
    tracing::debug!(path = %path.display(), "wrote acquisition summary");
    Ok(path.to_path_buf())
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> FetchResult<PathBuf> {
    let file = File::create(path).map_err(|e| FetchError::io("could not create", path, e))?;
    serde_yaml::to_writer(file, value)
        .map_err(|e| FetchError::io("could not write", path, io::Error::new(io::ErrorKind::Other, e)))?;
    tracing::debug!(path = %path.display(), "wrote stemcell assignment");
    Ok(path.to_path_buf())
}

/// Drives a product (and optionally stemcell) acquisition against a source.
pub struct Acquirer {
    source: Arc<dyn ArtifactSource>,
    progress: Option<ProgressFactory>,
}

impl Acquirer {
    pub fn new(source: Arc<dyn ArtifactSource>) -> Self {
        Self { source, progress: None }
    }

    /// Report download progress through callbacks built by `factory`.
    pub fn with_progress(mut self, factory: ProgressFactory) -> Self {
        self.progress = Some(factory);
        self
    }

    pub fn source(&self) -> &dyn ArtifactSource {
        self.source.as_ref()
    }

    /// Run the acquisition described by `request`.
    pub fn acquire(&self, request: &AcquireRequest) -> FetchResult<AcquireOutcome> {
        request.validate()?;

        let versions = self.source.list_versions(&request.slug)?;
        let version = select_version(&request.slug, &versions, &request.version)?;
        tracing::info!(slug = %request.slug, version = %version, source = self.source.name(), "selected product version");

        let (product_path, artifact) = self.fetch_file(
            &request.slug,
            &version,
            &request.file_glob,
            &request.output_dir,
            request,
        )?;

        let mut outcome = AcquireOutcome {
            product_path,
            product_slug: request.slug.clone(),
            product_version: version,
            stemcell_path: None,
            stemcell_version: None,
            assign_stemcell: None,
        };

        let Some(stemcell) = &request.stemcell else {
            return Ok(outcome);
        };
        if outcome.product_path.extension().map_or(true, |ext| ext != "pivotal") {
            tracing::warn!(
                path = %outcome.product_path.display(),
                "the downloaded file is not a .pivotal file, not fetching a stemcell"
            );
            return Ok(outcome);
        }

        let (stemcell_version, stemcell_path) = self.fetch_stemcell(&artifact, &outcome.product_path, stemcell, request)?;
        let product_name = read_tile_metadata(&outcome.product_path)?.name;
        outcome.assign_stemcell = Some(AssignStemcell {
            product: product_name,
            stemcell: stemcell_version.clone(),
        });
        outcome.stemcell_path = Some(stemcell_path);
        outcome.stemcell_version = Some(stemcell_version);
        Ok(outcome)
    }

    fn fetch_stemcell(
        &self,
        product: &ArtifactRef,
        product_path: &Path,
        stemcell: &StemcellRequest,
        request: &AcquireRequest,
    ) -> FetchResult<(String, PathBuf)> {
        let dependency = self
            .source
            .stemcell_for(product, product_path, stemcell.slug.as_deref())?;
        let version = stemcell.version.clone().unwrap_or(dependency.version);
        let output_dir = stemcell.output_dir.as_deref().unwrap_or(&request.output_dir);

        let mut last_error = None;
        for glob in stemcell.globs() {
            match self.fetch_file(&dependency.slug, &version, &glob, output_dir, request) {
                Ok((path, _)) => return Ok((version, path)),
                Err(e) => {
                    tracing::debug!(glob = %glob, error = %e, "stemcell glob did not resolve");
                    last_error = Some(e);
                }
            }
        }

        Err(FetchError::NoStemcellFile {
            iaas: stemcell.iaas.clone(),
            heavy: stemcell.heavy,
            source: Box::new(last_error.unwrap_or_else(|| FetchError::NoFileMatch {
                glob: String::new(),
                available: "none".to_string(),
            })),
        })
    }

    fn fetch_file(
        &self,
        slug: &str,
        version: &str,
        glob: &str,
        output_dir: &Path,
        request: &AcquireRequest,
    ) -> FetchResult<(PathBuf, ArtifactRef)> {
        let artifact = self.source.resolve_file(slug, version, glob)?;

        let file_name = artifact.file_name();
        let local_name = if request.blob_prefix && strip_blob_prefix(file_name) == file_name {
            format!("{}{}", blob_prefix(slug, version), file_name)
        } else {
            file_name.to_string()
        };
        let path = output_dir.join(&local_name);

        tracing::info!(file = %artifact.name(), source = self.source.name(), "attempting to download");

        if request.cleanup_cache {
            cleanup_cache(output_dir, glob, slug, &path)?;
        }

        if path.exists() {
            tracing::info!(path = %path.display(), "already exists, skipping download");
            return Ok((path, artifact));
        }

        let partial = partial_path(&path);
        File::create(&partial).map_err(|e| FetchError::io("could not create", &partial, e))?;

        if let Err(e) = self.download_verified(&artifact, &partial, &local_name) {
            if let Err(remove) = fs::remove_file(&partial) {
                tracing::debug!(path = %partial.display(), error = %remove, "could not remove partial download");
            }
            return Err(e);
        }

        fs::rename(&partial, &path).map_err(|e| FetchError::io("could not rename", &partial, e))?;
        Ok((path, artifact))
    }

    fn download_verified(&self, artifact: &ArtifactRef, partial: &Path, label: &str) -> FetchResult<()> {
        let meter = Arc::new(ProgressMeter::default());
        let reporter = self
            .progress
            .as_ref()
            .map(|factory| ProgressReporter::start_default(Arc::clone(&meter), factory(label)));

        let result = self.source.download(artifact, partial, &meter);
        drop(reporter);
        result?;

        if let Some(expected) = artifact.sha256() {
            tracing::info!(path = %partial.display(), "calculating sha256");
            verify_checksum(partial, expected, self.source.name())?;
        }
        Ok(())
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut partial = OsString::from(path.as_os_str());
    partial.push(".partial");
    PathBuf::from(partial)
}

/// Remove files in `dir` matching `glob`, plain or `[slug,*]`-prefixed, except `keep`.
fn cleanup_cache(dir: &Path, glob: &str, slug: &str, keep: &Path) -> FetchResult<()> {
    let pattern = compile_glob(glob)?;
    let slug_prefix = format!("[{},", slug);
    let entries = fs::read_dir(dir).map_err(|e| FetchError::io("could not list", dir, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| FetchError::io("could not list", dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let stripped = strip_blob_prefix(&name);
        let matches = pattern.matches(&name) || (name.starts_with(&slug_prefix) && pattern.matches(stripped));

        let path = entry.path();
        if matches && path != keep && path.is_file() {
            tracing::info!(path = %path.display(), "cleaning up cached file");
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "could not clean up cached file");
            }
        }
    }
    Ok(())
}
