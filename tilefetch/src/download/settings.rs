//! Configuration for the ranged download engine.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default number of concurrent range workers.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Default time a range body may stay silent before it is retried.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wall-clock limit for the HEAD request.
pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Default pause between attempts on the same range.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Referer sent with every engine request; some upstreams require it.
pub const DEFAULT_REFERER: &str = "https://go-pivnet.network.pivotal.io";

/// Smallest chunk size picked automatically (1 MiB).
pub const MIN_AUTO_CHUNK_SIZE: u64 = 1024 * 1024;

/// Configuration for [`RangedDownloader`](super::RangedDownloader).
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Fixed range size in bytes; `None` derives it from the content length.
    pub chunk_size: Option<u64>,

    /// Maximum number of ranges fetched at once.
    pub max_concurrency: usize,

    /// How long a range body may go without delivering a byte. Enforced by
    /// the transport; pass it to [`HttpClients::new`](crate::http::HttpClients::new).
    pub inactivity_timeout: Duration,

    /// Wall-clock limit for the HEAD request.
    pub head_timeout: Duration,

    /// Pause before a range is retried.
    pub retry_delay: Duration,

    /// Value of the `Referer` header.
    pub referer: String,

    /// Cancels the job when triggered.
    pub cancel: CancellationToken,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            chunk_size: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            referer: DEFAULT_REFERER.to_string(),
            cancel: CancellationToken::new(),
        }
    }
}

impl DownloadSettings {
    /// Set a fixed chunk size (minimum 1).
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }

    /// Set the maximum concurrency (minimum 1).
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the inactivity timeout.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Set the HEAD timeout.
    pub fn with_head_timeout(mut self, timeout: Duration) -> Self {
        self.head_timeout = timeout;
        self
    }

    /// Set the delay between attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the `Referer` header value.
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = referer.into();
        self
    }

    /// Use `token` to cancel downloads.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Chunk size for content of `content_length` bytes.
    ///
    /// Without a fixed size, the content is split so that each worker gets
    /// about one range, but never into ranges smaller than 1 MiB.
    pub fn chunk_size_for(&self, content_length: u64) -> u64 {
        match self.chunk_size {
            Some(size) => size.max(1),
            None => content_length
                .div_ceil(self.max_concurrency.max(1) as u64)
                .max(MIN_AUTO_CHUNK_SIZE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = DownloadSettings::default();
        assert_eq!(settings.max_concurrency, 10);
        assert_eq!(settings.inactivity_timeout, Duration::from_secs(5));
        assert_eq!(settings.head_timeout, Duration::from_secs(30));
        assert_eq!(settings.referer, DEFAULT_REFERER);
        assert!(settings.chunk_size.is_none());
    }

    #[test]
    fn test_builder_pattern() {
        let settings = DownloadSettings::default()
            .with_chunk_size(0)
            .with_max_concurrency(0)
            .with_retry_delay(Duration::ZERO)
            .with_referer("https://example.com");

        assert_eq!(settings.chunk_size, Some(1));
        assert_eq!(settings.max_concurrency, 1);
        assert_eq!(settings.retry_delay, Duration::ZERO);
        assert_eq!(settings.referer, "https://example.com");
    }

    #[test]
    fn test_auto_chunk_size() {
        let settings = DownloadSettings::default();
        // Small content is a single range.
        assert_eq!(settings.chunk_size_for(1000), MIN_AUTO_CHUNK_SIZE);
        // Large content is spread over the workers.
        assert_eq!(settings.chunk_size_for(100 * 1024 * 1024 + 1), 10 * 1024 * 1024 + 1);

        let fixed = DownloadSettings::default().with_chunk_size(10);
        assert_eq!(fixed.chunk_size_for(1000), 10);
    }
}
