//! HTTP transport used by the download engine.
//!
//! [`RangeTransport`] is the seam between the engine and the network. Its
//! failures are reported as [`TransportError`], whose [`retryable`]
//! predicate is the only thing the engine consults when deciding whether to
//! try a range again.
//!
//! [`retryable`]: TransportError::retryable

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use reqwest::blocking::RequestBuilder;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, RANGE, REFERER};
use reqwest::{Method, StatusCode};
use thiserror::Error;

use super::range::ByteRange;
use crate::error::FetchError;
use crate::http::{ClientKind, HttpClients};

/// A range response body.
pub type RangeBody = Box<dyn Read + Send>;

/// Result of a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    /// `Content-Length` of the resource, if the server sent one.
    pub content_length: Option<u64>,
    /// URL at the end of the redirect chain.
    pub final_url: String,
}

/// Failure of a single request or body transfer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A network failure that may go away by itself.
    #[error("temporary network error: {0}")]
    TemporaryNet(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// The body ended before the range was complete.
    #[error("unexpected EOF: {0}")]
    UnexpectedEof(String),

    /// The body went silent for longer than the inactivity timeout.
    #[error("no data received: {0}")]
    InactivityTimeout(String),

    /// The signed URL expired; a fresh one should be requested.
    #[error("status {0}, URL needs refreshing")]
    StatusRefreshable(u16),

    /// The server answered with a status that is not retried.
    #[error("unexpected status code {0}")]
    Status(u16),

    /// The body carried more bytes than the range asked for.
    #[error("range {range} returned more than {expected} bytes")]
    ContentLengthMismatch { range: String, expected: u64 },

    #[error("{0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether the failed request should be sent again.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::TemporaryNet(_)
                | Self::ConnectionReset(_)
                | Self::UnexpectedEof(_)
                | Self::InactivityTimeout(_)
                | Self::StatusRefreshable(_)
        )
    }

    /// Whether a retry needs a fresh URL first.
    pub fn needs_fresh_url(&self) -> bool {
        matches!(self, Self::StatusRefreshable(_))
    }

    /// Classify an I/O error from a body stream.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::InactivityTimeout(err.to_string()),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionReset(err.to_string()),
            io::ErrorKind::UnexpectedEof => Self::UnexpectedEof(err.to_string()),
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => Self::TemporaryNet(err.to_string()),
            _ => Self::Fatal(err.to_string()),
        }
    }

    /// Classify a request error.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(io_err) = find_io_error(err) {
            let classified = Self::from_io(io_err);
            if classified.retryable() {
                return classified;
            }
        }

        if err.is_timeout() {
            Self::InactivityTimeout(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Self::TemporaryNet(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }

    /// Convert a terminal failure of `method url` into a [`FetchError`].
    pub(crate) fn into_fetch_error(self, method: &str, url: &str) -> FetchError {
        match self {
            Self::Status(status) | Self::StatusRefreshable(status) => FetchError::BadStatus {
                method: method.to_string(),
                url: url.to_string(),
                status,
            },
            other => FetchError::transport(url, other),
        }
    }

    /// Map a response status to an error, `None` when it is `expected`.
    pub fn from_status(status: StatusCode, expected: StatusCode) -> Option<Self> {
        if status == expected {
            None
        } else if status == StatusCode::FORBIDDEN {
            Some(Self::StatusRefreshable(status.as_u16()))
        } else {
            Some(Self::Status(status.as_u16()))
        }
    }
}

fn find_io_error<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a io::Error> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        current = e.source();
    }
    None
}

/// Network access needed by the engine.
pub trait RangeTransport: Send + Sync {
    /// Request `url` with HEAD for its size and final location.
    fn head(&self, url: &str, referer: &str) -> Result<HeadInfo, TransportError>;

    /// Request `range` of `url`; only a `206 Partial Content` yields a body.
    ///
    /// A read on the body must not block indefinitely: once the connection
    /// has been silent for the inactivity timeout it fails with
    /// [`io::ErrorKind::TimedOut`], and dropping the body releases the
    /// connection.
    fn get_range(&self, url: &str, range: ByteRange, referer: &str) -> Result<RangeBody, TransportError>;
}

/// Authenticates individual requests, e.g. with a request signature.
pub trait RequestSigner: Send + Sync + fmt::Debug {
    /// Headers to send with `method url`.
    fn sign(&self, method: &Method, url: &str) -> Result<HeaderMap, TransportError>;
}

/// [`RangeTransport`] over the shared reqwest clients.
///
/// Body reads are bounded by [`HttpClients::read_timeout`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    clients: Arc<HttpClients>,
    signer: Option<Arc<dyn RequestSigner>>,
}

impl ReqwestTransport {
    pub fn new(clients: Arc<HttpClients>) -> Self {
        Self { clients, signer: None }
    }

    /// Add the headers from `signer` to every request.
    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    fn signature(&self, method: &Method, url: &str) -> Result<HeaderMap, TransportError> {
        match &self.signer {
            Some(signer) => signer.sign(method, url),
            None => Ok(HeaderMap::new()),
        }
    }
}

impl RangeTransport for ReqwestTransport {
    fn head(&self, url: &str, referer: &str) -> Result<HeadInfo, TransportError> {
        let signature = self.signature(&Method::HEAD, url)?;
        let response = self
            .clients
            .send(ClientKind::Head, |client| {
                with_referer(client.head(url), referer).headers(signature.clone())
            })
            .map_err(|e| TransportError::from_reqwest(&e))?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        // HEAD bodies are empty, so the header has to be read directly.
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());

        Ok(HeadInfo {
            content_length,
            final_url: response.url().to_string(),
        })
    }

    fn get_range(&self, url: &str, range: ByteRange, referer: &str) -> Result<RangeBody, TransportError> {
        let signature = self.signature(&Method::GET, url)?;
        let response = self
            .clients
            .send(ClientKind::Transfer, |client| {
                with_referer(client.get(url).header(RANGE, range.header_value()), referer).headers(signature.clone())
            })
            .map_err(|e| TransportError::from_reqwest(&e))?;

        if let Some(err) = TransportError::from_status(response.status(), StatusCode::PARTIAL_CONTENT) {
            return Err(err);
        }

        Ok(Box::new(ResponseBody { inner: response }))
    }
}

/// An empty referer sends no header.
fn with_referer(request: RequestBuilder, referer: &str) -> RequestBuilder {
    if referer.is_empty() {
        request
    } else {
        request.header(REFERER, referer)
    }
}

/// Body reader that reports a silent connection as [`io::ErrorKind::TimedOut`]
/// and any other mid-stream failure as a truncated body.
struct ResponseBody {
    inner: reqwest::blocking::Response,
}

fn is_read_timeout(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .is_some_and(reqwest::Error::is_timeout)
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|e| match e.kind() {
            _ if is_read_timeout(&e) => io::Error::new(io::ErrorKind::TimedOut, e.to_string()),
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted => e,
            _ => io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()),
        })
    }
}
