//! S3-compatible bucket store.
//!
//! The bucket is read over HTTP(S) with path-style URLs
//! (`<endpoint>/<bucket>/<key>`), anonymously or with SigV4-signed requests.
//! Listing uses `ListObjectsV2` and follows continuation tokens until the
//! listing is complete.

use std::io::Read;
use std::sync::Arc;

use reqwest::header::HeaderMap;
use reqwest::{Method, Url};
use serde::Deserialize;

use super::sigv4::SigV4Signer;
use super::store::{BlobStore, ReadSeek};
use crate::download::{RangeTransport, ReqwestTransport};
use crate::error::{FetchError, FetchResult};
use crate::http::{ClientKind, HttpClients};
use crate::tile::HttpRangeReader;

/// Upper bound on listing pages, as a guard against a server that never
/// stops returning continuation tokens.
const MAX_LIST_PAGES: usize = 10_000;

#[derive(Debug, Deserialize)]
struct ListBucketResult {
    #[serde(rename = "Contents", default)]
    contents: Vec<ObjectEntry>,
    #[serde(rename = "IsTruncated", default)]
    is_truncated: bool,
    #[serde(rename = "NextContinuationToken", default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    #[serde(rename = "Key")]
    key: String,
}

/// A bucket of an S3-compatible object store.
pub struct S3BlobStore {
    bucket_url: Url,
    clients: Arc<HttpClients>,
    transport: Arc<dyn RangeTransport>,
    signer: Option<Arc<SigV4Signer>>,
}

impl std::fmt::Debug for S3BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3BlobStore")
            .field("bucket_url", &self.bucket_url.as_str())
            .field("signer", &self.signer)
            .finish()
    }
}

impl S3BlobStore {
    /// Open the bucket at `bucket_url`, e.g. `https://s3.example.com/mirror`.
    pub fn new(bucket_url: &str, clients: Arc<HttpClients>) -> FetchResult<Self> {
        let mut parsed = Url::parse(bucket_url)
            .map_err(|e| FetchError::Config(format!("invalid bucket URL {:?}: {}", bucket_url, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(FetchError::Config(format!("invalid bucket URL {:?}", bucket_url)));
        }
        if !parsed.path().ends_with('/') {
            let path = format!("{}/", parsed.path());
            parsed.set_path(&path);
        }

        Ok(Self {
            bucket_url: parsed,
            transport: Arc::new(ReqwestTransport::new(clients.clone())),
            clients,
            signer: None,
        })
    }

    /// Sign every request with `signer`.
    pub fn with_signer(mut self, signer: Arc<SigV4Signer>) -> Self {
        self.transport = Arc::new(ReqwestTransport::new(self.clients.clone()).with_signer(signer.clone()));
        self.signer = Some(signer);
        self
    }

    /// Use `transport` for size lookups and ranged reads.
    pub fn with_transport(mut self, transport: Arc<dyn RangeTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// The transport for ranged downloads of this bucket's objects.
    pub fn transport(&self) -> Arc<dyn RangeTransport> {
        self.transport.clone()
    }

    fn signature(&self, method: &Method, url: &Url) -> FetchResult<HeaderMap> {
        match &self.signer {
            Some(signer) => signer.headers(method, url),
            None => Ok(HeaderMap::new()),
        }
    }

    fn object_url(&self, key: &str) -> FetchResult<Url> {
        let mut url = self.bucket_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| FetchError::Config(format!("invalid bucket URL {}", self.bucket_url)))?;
            segments.pop_if_empty();
            segments.extend(key.split('/').filter(|part| !part.is_empty()));
        }
        Ok(url)
    }

    fn list_page(&self, continuation: Option<&str>) -> FetchResult<ListBucketResult> {
        let mut url = self.bucket_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("list-type", "2");
            if let Some(token) = continuation {
                query.append_pair("continuation-token", token);
            }
        }
        let signature = self.signature(&Method::GET, &url)?;
        let url = url.to_string();

        let response = self
            .clients
            .send(ClientKind::Api, |client| client.get(&url).headers(signature.clone()))
            .map_err(|e| FetchError::transport(&url, e))?;
        if !response.status().is_success() {
            return Err(FetchError::BadStatus {
                method: "GET".to_string(),
                url,
                status: response.status().as_u16(),
            });
        }

        let body = response
            .text()
            .map_err(|e| FetchError::transport(&url, format!("could not read listing: {}", e)))?;
        serde_xml_rs::from_str(&body)
            .map_err(|e| FetchError::transport(&url, format!("could not parse listing: {}", e)))
    }
}

impl BlobStore for S3BlobStore {
    fn name(&self) -> String {
        format!("bucket {}", self.bucket_url)
    }

    fn list_keys(&self) -> FetchResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        for page in 0..MAX_LIST_PAGES {
            let result = self.list_page(continuation.as_deref())?;
            tracing::trace!(page, objects = result.contents.len(), "listed bucket page");
            keys.extend(result.contents.into_iter().map(|entry| entry.key));

            match result.next_continuation_token {
                Some(token) if result.is_truncated && !token.is_empty() => continuation = Some(token),
                _ => break,
            }
        }

        Ok(keys)
    }

    fn size(&self, key: &str) -> FetchResult<u64> {
        let url = self.object_url(key)?.to_string();
        let info = self
            .transport
            .head(&url, "")
            .map_err(|e| e.into_fetch_error("HEAD", &url))?;
        info.content_length.ok_or(FetchError::UnknownSize { url })
    }

    fn open(&self, key: &str) -> FetchResult<Box<dyn Read + Send>> {
        let object_url = self.object_url(key)?;
        let signature = self.signature(&Method::GET, &object_url)?;
        let url = object_url.to_string();
        let response = self
            .clients
            .send(ClientKind::Transfer, |client| client.get(&url).headers(signature.clone()))
            .map_err(|e| FetchError::transport(&url, e))?;
        if !response.status().is_success() {
            return Err(FetchError::BadStatus {
                method: "GET".to_string(),
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(Box::new(response))
    }

    fn open_seekable(&self, key: &str) -> FetchResult<Box<dyn ReadSeek>> {
        let url = self.object_url(key)?.to_string();
        let reader = HttpRangeReader::open(self.transport.clone(), &url, "")?;
        Ok(Box::new(reader))
    }

    fn download_url(&self, key: &str) -> Option<String> {
        self.object_url(key).ok().map(String::from)
    }
}
