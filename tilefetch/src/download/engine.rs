//! The ranged download engine.
//!
//! A HEAD request sizes the content, the destination filesystem is checked for
//! room, and the content is split into byte ranges fetched by a bounded set
//! of worker threads. Each worker writes its ranges through its own file
//! handle, so writes never share a cursor.
//!
//! Per range:
//!
//! ```text
//! ISSUE_GET ──206──> COPY ──clean EOF──> DONE
//!     │                │
//!     │ 403            │ reset / EOF / timeout / temporary error
//!     ▼                ▼
//! REFRESH_URL      REWIND + RETRY (from the range start)
//! ```
//!
//! Any other status, or a second 403 on a freshly refreshed URL, fails the
//! job. The first failure cancels the remaining workers.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::disk::{ensure_space, space_check_path, DiskSpace, StatvfsDiskSpace};
use super::progress::ProgressMeter;
use super::range::{build_ranges, ByteRange};
use super::settings::DownloadSettings;
use super::transport::{RangeTransport, TransportError};
use super::url::UrlSource;
use super::CANCEL_POLL_INTERVAL;
use crate::error::{FetchError, FetchResult};

/// Buffer size for copying range bodies (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Summary of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    /// Bytes written.
    pub content_length: u64,
    /// URL the content was fetched from after the HEAD redirects.
    pub content_url: String,
    /// Number of ranges the content was split into.
    pub ranges: usize,
}

/// Parallel byte-range downloader.
pub struct RangedDownloader {
    transport: Arc<dyn RangeTransport>,
    disk: Arc<dyn DiskSpace>,
    settings: DownloadSettings,
}

impl RangedDownloader {
    /// Create a downloader using `transport` for all network access.
    pub fn new(transport: Arc<dyn RangeTransport>, settings: DownloadSettings) -> Self {
        Self {
            transport,
            disk: Arc::new(StatvfsDiskSpace),
            settings,
        }
    }

    /// Replace the free-space query used by the preflight check.
    pub fn with_disk_space(mut self, disk: Arc<dyn DiskSpace>) -> Self {
        self.disk = disk;
        self
    }

    pub fn settings(&self) -> &DownloadSettings {
        &self.settings
    }

    /// Download the content behind `urls` into `destination`.
    ///
    /// The destination is created if needed and sized to the content length.
    /// Its contents are only meaningful when this returns `Ok`.
    pub fn download(
        &self,
        urls: &dyn UrlSource,
        destination: &Path,
        meter: &ProgressMeter,
    ) -> FetchResult<DownloadReport> {
        let cancel = &self.settings.cancel;
        let head_url = urls.fresh()?;
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled { url: head_url });
        }

        let info = self
            .transport
            .head(&head_url, &self.settings.referer)
            .map_err(|e| self.head_error(&head_url, e))?;

        let content_length = match info.content_length {
            Some(0) => return Err(FetchError::EmptyContent { url: head_url }),
            Some(n) => n,
            None => return Err(FetchError::UnknownSize { url: head_url }),
        };

        ensure_space(self.disk.as_ref(), &space_check_path(destination), content_length)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(destination)
            .map_err(|e| FetchError::io("could not open", destination, e))?;
        file.set_len(content_length)
            .map_err(|e| FetchError::io("could not size", destination, e))?;
        drop(file);

        let ranges = build_ranges(content_length, self.settings.chunk_size_for(content_length));
        let workers = self.settings.max_concurrency.clamp(1, ranges.len());
        meter.set_total(content_length);

        tracing::info!(
            url = %info.final_url,
            content_length,
            ranges = ranges.len(),
            workers,
            "starting ranged download"
        );

        let job = Job {
            transport: self.transport.as_ref(),
            urls,
            settings: &self.settings,
            destination: destination.to_path_buf(),
            current_url: RwLock::new(info.final_url.clone()),
            ranges: &ranges,
            next: AtomicUsize::new(0),
            meter,
            cancel: cancel.child_token(),
            first_error: Mutex::new(None),
        };

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| job.run_worker());
            }
        });

        if let Some(err) = job.first_error.lock().take() {
            tracing::debug!(error = %err, "ranged download failed");
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled {
                url: info.final_url,
            });
        }

        tracing::info!(path = %destination.display(), content_length, "download complete");
        Ok(DownloadReport {
            content_length,
            content_url: info.final_url,
            ranges: ranges.len(),
        })
    }

    fn head_error(&self, url: &str, err: TransportError) -> FetchError {
        match err {
            TransportError::InactivityTimeout(_) => FetchError::Timeout {
                url: url.to_string(),
                timeout_secs: self.settings.head_timeout.as_secs(),
            },
            other => other.into_fetch_error("HEAD", url),
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
    }
    false
}

/// Why a single attempt at a range ended early.
enum AttemptError {
    /// Local failure or cancellation; the range is abandoned.
    Abort(FetchError),
    /// Network failure after `counted` bytes were added to the meter.
    Transport {
        error: TransportError,
        counted: u64,
        responded: bool,
    },
}

/// Shared state of one download job.
struct Job<'a> {
    transport: &'a dyn RangeTransport,
    urls: &'a dyn UrlSource,
    settings: &'a DownloadSettings,
    destination: PathBuf,
    current_url: RwLock<String>,
    ranges: &'a [ByteRange],
    next: AtomicUsize,
    meter: &'a ProgressMeter,
    cancel: CancellationToken,
    first_error: Mutex<Option<FetchError>>,
}

impl Job<'_> {
    fn run_worker(&self) {
        let mut file = match OpenOptions::new().write(true).open(&self.destination) {
            Ok(file) => file,
            Err(e) => {
                self.fail(FetchError::io("could not open", &self.destination, e));
                return;
            }
        };

        while !self.cancel.is_cancelled() {
            let index = self.next.fetch_add(1, Ordering::SeqCst);
            let Some(range) = self.ranges.get(index).copied() else {
                return;
            };

            if let Err(e) = self.fetch_range(&mut file, range) {
                self.fail(e);
                return;
            }
        }
    }

    fn fail(&self, err: FetchError) {
        {
            let mut slot = self.first_error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.cancel.cancel();
    }

    fn cancelled(&self) -> FetchError {
        FetchError::Cancelled {
            url: self.current_url.read().clone(),
        }
    }

    fn fetch_range(&self, file: &mut File, range: ByteRange) -> FetchResult<()> {
        let mut refreshed_without_response = false;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            let url = self.current_url.read().clone();
            let (error, counted, responded) = match self.attempt(file, &url, range) {
                Ok(()) => return Ok(()),
                Err(AttemptError::Abort(e)) => return Err(e),
                Err(AttemptError::Transport {
                    error,
                    counted,
                    responded,
                }) => (error, counted, responded),
            };

            if counted > 0 {
                self.meter.rewind(counted);
            }
            if responded {
                refreshed_without_response = false;
            }

            if error.needs_fresh_url() {
                if refreshed_without_response {
                    return Err(FetchError::BadStatus {
                        method: "GET".to_string(),
                        url,
                        status: 403,
                    });
                }
                tracing::debug!(range = %range, "download URL rejected, requesting a fresh one");
                self.refresh_url(&url)?;
                refreshed_without_response = true;
                continue;
            }

            if !error.retryable() {
                return Err(match error {
                    TransportError::Status(status) => FetchError::BadStatus {
                        method: "GET".to_string(),
                        url,
                        status,
                    },
                    other => FetchError::transport(&url, other),
                });
            }

            tracing::debug!(range = %range, rewound = counted, error = %error, "retrying range");
            if !pause(&self.cancel, self.settings.retry_delay) {
                return Err(self.cancelled());
            }
        }
    }

    /// Replace `stale` with a fresh URL unless another worker already did.
    fn refresh_url(&self, stale: &str) -> FetchResult<()> {
        let mut current = self.current_url.write();
        if *current == stale {
            *current = self.urls.fresh()?;
        }
        Ok(())
    }

    fn attempt(&self, file: &mut File, url: &str, range: ByteRange) -> Result<(), AttemptError> {
        file.seek(SeekFrom::Start(range.lower))
            .map_err(|e| AttemptError::Abort(FetchError::io("could not seek in", &self.destination, e)))?;

        let mut body = self
            .transport
            .get_range(url, range, &self.settings.referer)
            .map_err(|error| AttemptError::Transport {
                error,
                counted: 0,
                responded: false,
            })?;

        let mut buffer = vec![0u8; BUFFER_SIZE];
        let expected = range.len();
        let mut received = 0u64;

        let transport_error = |error, counted| AttemptError::Transport {
            error,
            counted,
            responded: true,
        };

        // Each read returns within the inactivity timeout, so cancellation is
        // noticed between reads.
        loop {
            if self.cancel.is_cancelled() {
                return Err(AttemptError::Abort(self.cancelled()));
            }
            let n = match body.read(&mut buffer) {
                Ok(n) => n,
                Err(_) if self.cancel.is_cancelled() => {
                    return Err(AttemptError::Abort(self.cancelled()));
                }
                Err(e) => return Err(transport_error(TransportError::from_io(&e), received)),
            };

            if n == 0 {
                if received < expected {
                    return Err(transport_error(
                        TransportError::UnexpectedEof(format!(
                            "range {} ended after {} of {} bytes",
                            range, received, expected
                        )),
                        received,
                    ));
                }
                return Ok(());
            }

            if received + n as u64 > expected {
                return Err(transport_error(
                    TransportError::ContentLengthMismatch {
                        range: range.to_string(),
                        expected,
                    },
                    received,
                ));
            }

            file.write_all(&buffer[..n])
                .map_err(|e| AttemptError::Abort(FetchError::io("could not write", &self.destination, e)))?;
            received += n as u64;
            self.meter.add(n as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::disk::FixedDiskSpace;
    use crate::download::transport::{HeadInfo, RangeBody};
    use crate::download::url::StaticUrl;
    use crate::error::ErrorKind;
    use std::collections::VecDeque;
    use std::io::{self, Cursor};
    use tempfile::TempDir;

    /// What the mock server does with the next GET.
    #[derive(Debug, Clone)]
    enum Step {
        Serve,
        Truncate(usize),
        Status(u16),
        Oversized,
        /// Serve this many bytes, then go silent until the read times out.
        Stall(usize),
    }

    struct MockTransport {
        content: Vec<u8>,
        script: Mutex<VecDeque<Step>>,
        requests: Mutex<Vec<(String, ByteRange)>>,
        released_stalls: Arc<AtomicUsize>,
    }

    impl MockTransport {
        fn new(content: &[u8], script: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                content: content.to_vec(),
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
                released_stalls: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn requests(&self) -> Vec<(String, ByteRange)> {
            self.requests.lock().clone()
        }
    }

    struct FailAfter;

    /// A silent connection whose reads give up after `STALL`, the way a
    /// socket with a read timeout does. Counts how often it was dropped.
    struct Stalled {
        released: Arc<AtomicUsize>,
    }

    const STALL: Duration = Duration::from_millis(30);

    impl Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(STALL);
            Err(io::Error::new(io::ErrorKind::TimedOut, "no data received"))
        }
    }

    impl Drop for Stalled {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Read for FailAfter {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"))
        }
    }

    impl RangeTransport for MockTransport {
        fn head(&self, url: &str, _referer: &str) -> Result<HeadInfo, TransportError> {
            Ok(HeadInfo {
                content_length: Some(self.content.len() as u64),
                final_url: format!("{}?redirected", url),
            })
        }

        fn get_range(&self, url: &str, range: ByteRange, _referer: &str) -> Result<RangeBody, TransportError> {
            self.requests.lock().push((url.to_string(), range));
            let slice = self.content[range.lower as usize..=range.upper as usize].to_vec();
            let step = self.script.lock().pop_front().unwrap_or(Step::Serve);
            match step {
                Step::Serve => Ok(Box::new(Cursor::new(slice))),
                Step::Truncate(n) => Ok(Box::new(Cursor::new(slice[..n].to_vec()).chain(FailAfter))),
                Step::Status(code) => Err(TransportError::from_status(
                    reqwest::StatusCode::from_u16(code).unwrap(),
                    reqwest::StatusCode::PARTIAL_CONTENT,
                )
                .unwrap()),
                Step::Oversized => {
                    let mut body = slice;
                    body.push(b'!');
                    Ok(Box::new(Cursor::new(body)))
                }
                Step::Stall(n) => Ok(Box::new(Cursor::new(slice[..n].to_vec()).chain(Stalled {
                    released: self.released_stalls.clone(),
                }))),
            }
        }
    }

    fn settings() -> DownloadSettings {
        DownloadSettings::default().with_retry_delay(Duration::ZERO)
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_downloads_all_ranges() {
        let data = content(1000);
        let transport = MockTransport::new(&data, vec![]);
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.bin");
        let meter = ProgressMeter::default();

        let downloader = RangedDownloader::new(
            transport.clone(),
            settings().with_chunk_size(64).with_max_concurrency(4),
        );
        let report = downloader.download(&StaticUrl::new("http://cdn/file"), &dest, &meter).unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(report.ranges, 16);
        assert_eq!(report.content_url, "http://cdn/file?redirected");
        assert_eq!(meter.bytes(), 1000);
        assert_eq!(meter.total(), 1000);
        // Range requests go to the URL recorded after redirects.
        assert!(transport
            .requests()
            .iter()
            .all(|(url, _)| url == "http://cdn/file?redirected"));
    }

    #[test]
    fn test_unexpected_eof_rewinds_and_retries() {
        let data = b"0123456789".to_vec();
        let transport = MockTransport::new(&data, vec![Step::Truncate(4)]);
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.bin");
        let meter = ProgressMeter::default();

        RangedDownloader::new(transport.clone(), settings().with_chunk_size(10))
            .download(&StaticUrl::new("http://cdn/file"), &dest, &meter)
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(meter.rewinds(), 1);
        assert_eq!(meter.rewound_bytes(), 4);
        assert_eq!(meter.bytes(), 10);
        // The retry asks for the whole range again.
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].1, ByteRange::new(0, 9));
    }

    #[test]
    fn test_silent_body_times_out_and_retries() {
        let data = content(100);
        let transport = MockTransport::new(&data, vec![Step::Stall(30)]);
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.bin");
        let meter = ProgressMeter::default();

        RangedDownloader::new(
            transport.clone(),
            settings().with_chunk_size(100).with_inactivity_timeout(STALL),
        )
        .download(&StaticUrl::new("http://cdn/file"), &dest, &meter)
        .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(meter.rewinds(), 1);
        assert_eq!(meter.rewound_bytes(), 30);
        assert_eq!(meter.bytes(), 100);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].1, ByteRange::new(0, 99));
        // The silent body is dropped before the range is asked for again.
        assert_eq!(transport.released_stalls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forbidden_refreshes_url() {
        let data = content(10);
        let transport = MockTransport::new(&data, vec![Step::Status(403)]);
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.bin");
        let calls = AtomicUsize::new(0);
        let urls = || -> FetchResult<String> {
            Ok(format!("http://cdn/signed-{}", calls.fetch_add(1, Ordering::SeqCst)))
        };

        RangedDownloader::new(transport.clone(), settings())
            .download(&urls, &dest, &ProgressMeter::default())
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
        let requests = transport.requests();
        assert_eq!(requests[0].0, "http://cdn/signed-0?redirected");
        assert_eq!(requests[1].0, "http://cdn/signed-1");
    }

    #[test]
    fn test_forbidden_twice_is_bad_status() {
        let data = content(10);
        let transport = MockTransport::new(&data, vec![Step::Status(403), Step::Status(403)]);
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.bin");
        let calls = AtomicUsize::new(0);
        let urls = || -> FetchResult<String> {
            Ok(format!("http://cdn/signed-{}", calls.fetch_add(1, Ordering::SeqCst)))
        };

        let err = RangedDownloader::new(transport, settings())
            .download(&urls, &dest, &ProgressMeter::default())
            .unwrap_err();

        assert!(matches!(err, FetchError::BadStatus { status: 403, .. }));
        assert!(err.to_string().contains("signed-1"));
    }

    #[test]
    fn test_other_status_is_fatal() {
        let transport = MockTransport::new(&content(10), vec![Step::Status(500)]);
        let temp = TempDir::new().unwrap();

        let err = RangedDownloader::new(transport.clone(), settings())
            .download(
                &StaticUrl::new("http://cdn/file"),
                &temp.path().join("out.bin"),
                &ProgressMeter::default(),
            )
            .unwrap_err();

        assert!(matches!(err, FetchError::BadStatus { status: 500, .. }));
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn test_oversized_body_is_never_written() {
        let transport = MockTransport::new(&content(10), vec![Step::Oversized]);
        let temp = TempDir::new().unwrap();

        let err = RangedDownloader::new(transport, settings())
            .download(
                &StaticUrl::new("http://cdn/file"),
                &temp.path().join("out.bin"),
                &ProgressMeter::default(),
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransportError);
    }

    #[test]
    fn test_insufficient_space_fails_before_any_get() {
        let transport = MockTransport::new(&content(100), vec![]);
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.bin");

        let err = RangedDownloader::new(transport.clone(), settings())
            .with_disk_space(Arc::new(FixedDiskSpace(99)))
            .download(&StaticUrl::new("http://cdn/file"), &dest, &ProgressMeter::default())
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InsufficientSpace);
        assert!(transport.requests().is_empty());
        assert!(!dest.exists());
    }

    #[test]
    fn test_empty_content_is_rejected() {
        let transport = MockTransport::new(&[], vec![]);
        let temp = TempDir::new().unwrap();

        let err = RangedDownloader::new(transport, settings())
            .download(
                &StaticUrl::new("http://cdn/file"),
                &temp.path().join("out.bin"),
                &ProgressMeter::default(),
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::EmptyContent);
    }

    #[test]
    fn test_cancelled_before_start() {
        let transport = MockTransport::new(&content(10), vec![]);
        let temp = TempDir::new().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = RangedDownloader::new(transport.clone(), settings().with_cancellation(token))
            .download(
                &StaticUrl::new("http://cdn/file"),
                &temp.path().join("out.bin"),
                &ProgressMeter::default(),
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(transport.requests().is_empty());
    }

}
