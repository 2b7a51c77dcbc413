//! Error types for artifact acquisition.
//!
//! Every public operation returns a [`FetchError`]. Each variant names the
//! resource it concerns (slug, version, url, glob or path) so that messages
//! are useful on their own; [`FetchError::kind`] gives the coarse
//! classification callers can match on.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for acquisition operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Coarse classification of a [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRegex,
    NoMatch,
    Ambiguous,
    ReleaseNotFound,
    EulaRejected,
    AmbiguousStemcell,
    MalformedStemcellVersion,
    NoCompatibleStemcell,
    MetadataIncomplete,
    InvalidTile,
    UnknownSize,
    InsufficientSpace,
    EmptyContent,
    BadStatus,
    Timeout,
    TransportError,
    Cancelled,
    ChecksumMismatch,
    Io,
    Config,
    ProxyAuth,
    UnsupportedArtifact,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BadRegex => "bad regex",
            Self::NoMatch => "no match",
            Self::Ambiguous => "ambiguous",
            Self::ReleaseNotFound => "release not found",
            Self::EulaRejected => "EULA rejected",
            Self::AmbiguousStemcell => "ambiguous stemcell",
            Self::MalformedStemcellVersion => "malformed stemcell version",
            Self::NoCompatibleStemcell => "no compatible stemcell",
            Self::MetadataIncomplete => "metadata incomplete",
            Self::InvalidTile => "invalid tile",
            Self::UnknownSize => "unknown size",
            Self::InsufficientSpace => "insufficient space",
            Self::EmptyContent => "empty content",
            Self::BadStatus => "bad status",
            Self::Timeout => "timeout",
            Self::TransportError => "transport error",
            Self::Cancelled => "cancelled",
            Self::ChecksumMismatch => "checksum mismatch",
            Self::Io => "I/O error",
            Self::Config => "configuration error",
            Self::ProxyAuth => "proxy authentication error",
            Self::UnsupportedArtifact => "unsupported artifact",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while locating or downloading artifacts.
#[derive(Debug, Error)]
pub enum FetchError {
    /// A version regex failed to compile.
    #[error("could not compile regex {regex:?}: {source}")]
    BadRegex {
        regex: String,
        #[source]
        source: regex::Error,
    },

    /// No candidate version satisfied the request.
    #[error(
        "no valid versions found for product {slug:?} and {requested}\nexisting versions: {existing}"
    )]
    NoVersionMatch {
        slug: String,
        requested: String,
        existing: String,
    },

    /// A glob matched no file of the release.
    #[error("the glob '{glob}' matches no file\navailable files: {available}")]
    NoFileMatch { glob: String, available: String },

    /// A blob store holds no object carrying the `[slug,version]` prefix.
    #[error(
        "no product files with expected prefix [{slug},{version}] found in {store}. \
         Ensure the file was persisted with the [slug,version] naming convention"
    )]
    NoPrefixedFiles {
        store: String,
        slug: String,
        version: String,
    },

    /// A blob store holds no objects.
    #[error("{store} contains no files")]
    EmptyStore { store: String },

    /// A blob store holds no object for the slug at all.
    #[error("no files matching product slug {slug} found in {store}")]
    NoSlugFiles { store: String, slug: String },

    /// A glob matched more than one file.
    #[error(
        "the glob '{glob}' matches multiple files. Write your glob to match exactly one of the following:\n  {}",
        .candidates.join("\n  ")
    )]
    Ambiguous {
        glob: String,
        candidates: Vec<String>,
    },

    /// The catalog has no release for the requested version.
    #[error("could not fetch the release for {slug} {version}: {reason}")]
    ReleaseNotFound {
        slug: String,
        version: String,
        reason: String,
    },

    /// The catalog refused the EULA acceptance.
    #[error("could not accept the EULA for {slug} {version}: {reason}")]
    EulaRejected {
        slug: String,
        version: String,
        reason: String,
    },

    /// Several stemcell products qualify and no hint picks one.
    #[error(
        "multiple stemcell slugs are dependencies of {slug}: {}. Select one with a stemcell slug",
        .slugs.join(", ")
    )]
    AmbiguousStemcell { slug: String, slugs: Vec<String> },

    /// A stemcell version is not `major` or `major.minor`.
    #[error(
        "versioning of stemcell dependency in unexpected format: \"major.minor\" or \"major\". \
         the following version could not be parsed: {version}"
    )]
    MalformedStemcellVersion { version: String },

    /// No stemcell in the listing satisfies the criterion.
    #[error("no stemcell {slug} could be found equal to or greater than {version}: {reason}")]
    NoCompatibleStemcell {
        slug: String,
        version: String,
        reason: String,
    },

    /// None of the stemcell globs matched a file for the IaaS.
    #[error(
        "could not download stemcell: {source}\nNo {}stemcell identified for IaaS \"{iaas}\". \
         Correct the stemcell IaaS to match the IaaS portion of the stemcell filename, or remove it.",
        heavy_prefix(.heavy)
    )]
    NoStemcellFile {
        iaas: String,
        heavy: bool,
        #[source]
        source: Box<FetchError>,
    },

    /// Tile metadata lacks a required field.
    #[error("tile metadata from {source_name} is incomplete: {reason}")]
    MetadataIncomplete { source_name: String, reason: String },

    /// The tile could not be read as a ZIP archive carrying metadata.
    #[error("could not read tile {source_name}: {reason}")]
    InvalidTile { source_name: String, reason: String },

    /// HEAD did not report a usable Content-Length.
    #[error("could not determine the size of {url}: no Content-Length in HEAD response")]
    UnknownSize { url: String },

    /// The destination filesystem is too small.
    #[error(
        "file is too big to fit on the drive holding {}: {required} bytes required, {available} bytes free",
        .path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// The artifact has zero length.
    #[error("refusing to download empty content from {url}")]
    EmptyContent { url: String },

    /// The server answered with a status the engine does not accept.
    #[error("during {method} {url} unexpected status code was returned: {status}")]
    BadStatus {
        method: String,
        url: String,
        status: u16,
    },

    /// A request exceeded its time limit.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    /// A network failure that is not retried.
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    /// The caller cancelled the operation.
    #[error("download of {url} was cancelled")]
    Cancelled { url: String },

    /// A downloaded file does not hash to the declared SHA-256.
    #[error(
        "the sha ({expected}) from {source_name} does not match the calculated sha ({actual}) for the file {}",
        .path.display()
    )]
    ChecksumMismatch {
        source_name: String,
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Local file access failed.
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Proxy authentication could not be set up.
    #[error("proxy authentication failed: {0}")]
    ProxyAuth(String),

    /// An artifact reference was handed to a backend that did not produce it.
    #[error("{backend} cannot handle artifact {artifact}")]
    UnsupportedArtifact { backend: String, artifact: String },
}

impl FetchError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRegex { .. } => ErrorKind::BadRegex,
            Self::NoVersionMatch { .. }
            | Self::NoFileMatch { .. }
            | Self::NoPrefixedFiles { .. }
            | Self::EmptyStore { .. }
            | Self::NoStemcellFile { .. }
            | Self::NoSlugFiles { .. } => ErrorKind::NoMatch,
            Self::Ambiguous { .. } => ErrorKind::Ambiguous,
            Self::ReleaseNotFound { .. } => ErrorKind::ReleaseNotFound,
            Self::EulaRejected { .. } => ErrorKind::EulaRejected,
            Self::AmbiguousStemcell { .. } => ErrorKind::AmbiguousStemcell,
            Self::MalformedStemcellVersion { .. } => ErrorKind::MalformedStemcellVersion,
            Self::NoCompatibleStemcell { .. } => ErrorKind::NoCompatibleStemcell,
            Self::MetadataIncomplete { .. } => ErrorKind::MetadataIncomplete,
            Self::InvalidTile { .. } => ErrorKind::InvalidTile,
            Self::UnknownSize { .. } => ErrorKind::UnknownSize,
            Self::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            Self::EmptyContent { .. } => ErrorKind::EmptyContent,
            Self::BadStatus { .. } => ErrorKind::BadStatus,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Transport { .. } => ErrorKind::TransportError,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::Io { .. } => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
            Self::ProxyAuth(_) => ErrorKind::ProxyAuth,
            Self::UnsupportedArtifact { .. } => ErrorKind::UnsupportedArtifact,
        }
    }

    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn transport(url: &str, reason: impl fmt::Display) -> Self {
        Self::Transport {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn heavy_prefix(heavy: &bool) -> &'static str {
    if *heavy {
        "heavy "
    } else {
        ""
    }
}

/// Join names for an error message, using `none` for an empty list.
pub(crate) fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}
