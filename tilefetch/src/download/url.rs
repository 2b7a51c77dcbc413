//! Sources of download URLs.

use crate::error::FetchResult;

/// Hands out a currently valid URL for the content being downloaded.
///
/// Signed URLs expire; the engine calls [`fresh`](Self::fresh) once for the
/// HEAD request and again whenever a range request is answered with 403.
pub trait UrlSource: Send + Sync {
    fn fresh(&self) -> FetchResult<String>;
}

impl<F> UrlSource for F
where
    F: Fn() -> FetchResult<String> + Send + Sync,
{
    fn fresh(&self) -> FetchResult<String> {
        self()
    }
}

/// A URL that never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticUrl(pub String);

impl StaticUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }
}

impl UrlSource for StaticUrl {
    fn fresh(&self) -> FetchResult<String> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_closure_source() {
        let counter = AtomicUsize::new(0);
        let source = move || -> FetchResult<String> {
            Ok(format!("http://cdn/{}", counter.fetch_add(1, Ordering::SeqCst)))
        };

        assert_eq!(source.fresh().unwrap(), "http://cdn/0");
        assert_eq!(source.fresh().unwrap(), "http://cdn/1");
    }

    #[test]
    fn test_static_source() {
        let source = StaticUrl::new("http://cdn/file");
        assert_eq!(source.fresh().unwrap(), source.fresh().unwrap());
    }
}
