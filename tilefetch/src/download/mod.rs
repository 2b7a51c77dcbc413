//! Ranged download engine.
//!
//! This module provides parallel, resumable downloads of a single remote
//! file, including:
//! - Byte range decomposition (`range`)
//! - The HTTP seam and retry classification (`transport`)
//! - Free space preflight (`disk`)
//! - Real-time progress reporting (`progress`)
//! - SHA-256 verification of finished files (`checksum`)
//! - The engine itself (`engine`)
//!
//! # Architecture
//!
//! ```text
//! RangedDownloader (engine)
//!         │
//!         ├── UrlSource (fresh signed URLs)
//!         │
//!         ├── RangeTransport (trait)
//!         │       └── ReqwestTransport
//!         │
//!         ├── DiskSpace (trait)
//!         │       └── StatvfsDiskSpace
//!         │
//!         └── ProgressMeter ── ProgressReporter (real-time updates)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tilefetch::download::{
//!     DownloadSettings, ProgressMeter, RangedDownloader, ReqwestTransport, StaticUrl,
//! };
//! use tilefetch::http::HttpClients;
//!
//! let clients = Arc::new(HttpClients::direct()?);
//! let downloader = RangedDownloader::new(
//!     Arc::new(ReqwestTransport::new(clients)),
//!     DownloadSettings::default(),
//! );
//! let meter = ProgressMeter::default();
//! downloader.download(&StaticUrl::new("https://example.com/tile.pivotal"), path, &meter)?;
//! ```

use std::time::Duration;

mod checksum;
mod disk;
mod engine;
mod progress;
mod range;
mod settings;
mod transport;
mod url;

pub use checksum::{calculate_file_checksum, verify_checksum};
pub(crate) use disk::space_check_path;
pub use disk::{ensure_space, DiskSpace, FixedDiskSpace, StatvfsDiskSpace};
pub use engine::{DownloadReport, RangedDownloader};
pub use progress::{ProgressCallback, ProgressMeter, ProgressReporter};
pub use range::{build_ranges, ByteRange};
pub use settings::{
    DownloadSettings, DEFAULT_HEAD_TIMEOUT, DEFAULT_INACTIVITY_TIMEOUT, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_REFERER, DEFAULT_RETRY_DELAY, MIN_AUTO_CHUNK_SIZE,
};
pub use transport::{HeadInfo, RangeBody, RangeTransport, ReqwestTransport, RequestSigner, TransportError};
pub use url::{StaticUrl, UrlSource};

/// How often blocked waits look at the cancellation token.
pub(crate) const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);
