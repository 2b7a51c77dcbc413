//! Tilefetch - product tile and stemcell acquisition
//!
//! This library locates product files in a catalog service or a blob store,
//! picks versions, downloads files with parallel byte ranges and resolves the
//! stemcell each product tile needs.
//!
//! # Architecture
//!
//! ```text
//! acquire::Acquirer
//!     │
//!     ├── version (select a release)
//!     ├── source::ArtifactSource
//!     │       ├── CatalogSource ──┐
//!     │       └── BlobSource ─────┼── download::RangedDownloader
//!     │                           └── http::HttpClients ── proxy
//!     ├── tile (metadata inside .pivotal archives)
//!     └── stemcell (compatible version selection)
//! ```

pub mod acquire;
pub mod config;
pub mod download;
pub mod error;
pub mod http;
pub mod logging;
pub mod proxy;
pub mod source;
pub mod stemcell;
pub mod tile;
pub mod version;

pub use acquire::{AcquireOutcome, AcquireRequest, Acquirer, StemcellRequest};
pub use error::{ErrorKind, FetchError, FetchResult};
pub use source::{ArtifactRef, ArtifactSource};
