//! Catalog REST client.
//!
//! Thin typed wrappers over the `api/v2` endpoints the acquisition flow
//! needs. Each call sends the [`TokenSource`] header and fails with
//! [`FetchError::BadStatus`] on any non-success status.

use std::sync::Arc;

use reqwest::blocking::Response;
use reqwest::header::{ACCEPT, AUTHORIZATION, LOCATION};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::token::TokenSource;
use crate::error::{FetchError, FetchResult};
use crate::http::{ClientKind, HttpClients};

/// Public catalog host.
pub const DEFAULT_HOST: &str = "https://network.pivotal.io";

/// Limit reported for timed out API calls.
const API_TIMEOUT_SECS: u64 = 300;

/// One release of a product.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Release {
    pub id: u64,
    pub version: String,
}

/// One file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProductFile {
    pub id: u64,
    pub aws_object_key: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// A release another release depends on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseDependency {
    pub release: DependencyRelease,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DependencyRelease {
    #[serde(default)]
    pub id: u64,
    pub version: String,
    pub product: DependencyProduct,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DependencyProduct {
    pub slug: String,
}

#[derive(Deserialize)]
struct ReleasesResponse {
    #[serde(default)]
    releases: Vec<Release>,
}

#[derive(Deserialize)]
struct ProductFilesResponse {
    #[serde(default)]
    product_files: Vec<ProductFile>,
}

#[derive(Deserialize)]
struct DependenciesResponse {
    #[serde(default)]
    dependencies: Vec<ReleaseDependency>,
}

/// Client for the catalog API.
pub struct CatalogClient {
    host: String,
    token: Arc<dyn TokenSource>,
    clients: Arc<HttpClients>,
}

impl std::fmt::Debug for CatalogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogClient").field("host", &self.host).finish()
    }
}

impl CatalogClient {
    pub fn new(host: impl Into<String>, token: Arc<dyn TokenSource>, clients: Arc<HttpClients>) -> Self {
        Self {
            host: host.into(),
            token,
            clients,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v2{}", self.host.trim_end_matches('/'), path)
    }

    fn send(&self, kind: ClientKind, method: &str, url: &str) -> FetchResult<Response> {
        let authorization = self.token.authorization()?;
        let post = method == "POST";
        let response = self
            .clients
            .send(kind, |client| {
                let request = if post { client.post(url) } else { client.get(url) };
                request
                    .header(AUTHORIZATION, authorization.as_str())
                    .header(ACCEPT, "application/json")
            })
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout {
                        url: url.to_string(),
                        timeout_secs: API_TIMEOUT_SECS,
                    }
                } else {
                    FetchError::transport(url, e)
                }
            })?;
        tracing::debug!(method, url, status = response.status().as_u16(), "catalog request");
        Ok(response)
    }

    fn checked(&self, method: &str, url: &str) -> FetchResult<Response> {
        let response = self.send(ClientKind::Api, method, url)?;
        if !response.status().is_success() {
            return Err(FetchError::BadStatus {
                method: method.to_string(),
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> FetchResult<T> {
        let url = self.endpoint(path);
        self.checked("GET", &url)?
            .json::<T>()
            .map_err(|e| FetchError::transport(&url, format!("could not decode response: {}", e)))
    }

    /// Every release of `slug`, in API order.
    pub fn releases(&self, slug: &str) -> FetchResult<Vec<Release>> {
        let response: ReleasesResponse = self.get_json(&format!("/products/{}/releases", slug))?;
        Ok(response.releases)
    }

    /// Accept the EULA of a release. Accepting twice is harmless.
    pub fn accept_eula(&self, slug: &str, release_id: u64) -> FetchResult<()> {
        let url = self.endpoint(&format!(
            "/products/{}/releases/{}/pivnet_resource_eula_acceptance",
            slug, release_id
        ));
        self.checked("POST", &url)?;
        Ok(())
    }

    /// Files attached to a release.
    pub fn product_files(&self, slug: &str, release_id: u64) -> FetchResult<Vec<ProductFile>> {
        let response: ProductFilesResponse =
            self.get_json(&format!("/products/{}/releases/{}/product_files", slug, release_id))?;
        Ok(response.product_files)
    }

    /// Releases the given release declares as dependencies.
    pub fn dependencies(&self, slug: &str, release_id: u64) -> FetchResult<Vec<ReleaseDependency>> {
        let response: DependenciesResponse =
            self.get_json(&format!("/products/{}/releases/{}/dependencies", slug, release_id))?;
        Ok(response.dependencies)
    }

    /// Mint a signed download URL for a product file.
    ///
    /// The link is short-lived; call again for a fresh one.
    pub fn download_link(&self, slug: &str, release_id: u64, product_file_id: u64) -> FetchResult<String> {
        let url = self.endpoint(&format!(
            "/products/{}/releases/{}/product_files/{}/download",
            slug, release_id, product_file_id
        ));
        let response = self.send(ClientKind::NoRedirect, "POST", &url)?;
        let status = response.status();
        if !status.is_redirection() {
            return Err(FetchError::BadStatus {
                method: "POST".to_string(),
                url,
                status: status.as_u16(),
            });
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| FetchError::transport(&url, "download redirect has no Location header"))?;
        let link = response
            .url()
            .join(location)
            .map(String::from)
            .map_err(|e| FetchError::transport(&url, format!("invalid Location {:?}: {}", location, e)))?;

        tracing::debug!(slug, release_id, product_file_id, "minted download link");
        Ok(link)
    }
}
