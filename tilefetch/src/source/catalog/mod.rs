//! Catalog backend.
//!
//! Resolves releases and product files through the catalog API and
//! downloads them with the ranged engine. Download links are signed and
//! short-lived, so the engine is handed a closure that mints a new one
//! whenever a range is refused with 403.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use crate::download::{DiskSpace, DownloadSettings, ProgressMeter, RangeTransport, RangedDownloader, ReqwestTransport};
use crate::error::{FetchError, FetchResult};
use crate::http::HttpClients;
use crate::source::{base_name, compile_glob, single_match, ArtifactRef, ArtifactSource};
use crate::stemcell::{latest_compatible, latest_version, StemcellDependency};
use crate::tile::{fetch_tile_metadata, read_tile_metadata, TileMetadata};

mod api;
mod token;

pub use api::{
    CatalogClient, DependencyProduct, DependencyRelease, ProductFile, Release, ReleaseDependency, DEFAULT_HOST,
};
pub use token::{token_source, RefreshToken, StaticToken, TokenSource};

/// Product slugs of stemcells contain this marker.
const STEMCELL_SLUG_MARKER: &str = "stemcells";

/// A product file located in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogFile {
    pub slug: String,
    pub release_id: u64,
    pub release_version: String,
    pub product_file_id: u64,
    /// Storage key; its last component is the file name.
    pub object_key: String,
    pub sha256: Option<String>,
}

/// [`ArtifactSource`] backed by the catalog API.
pub struct CatalogSource {
    client: Arc<CatalogClient>,
    transport: Arc<dyn RangeTransport>,
    downloader: RangedDownloader,
}

impl CatalogSource {
    /// Create a source whose downloads use `clients`.
    pub fn new(client: CatalogClient, clients: Arc<HttpClients>, settings: DownloadSettings) -> Self {
        Self::with_transport(client, Arc::new(ReqwestTransport::new(clients)), settings)
    }

    /// Create a source downloading through `transport`.
    pub fn with_transport(
        client: CatalogClient,
        transport: Arc<dyn RangeTransport>,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            client: Arc::new(client),
            downloader: RangedDownloader::new(transport.clone(), settings),
            transport,
        }
    }

    /// Replace the free-space query used before downloads.
    pub fn with_disk_space(mut self, disk: Arc<dyn DiskSpace>) -> Self {
        self.downloader = self.downloader.with_disk_space(disk);
        self
    }

    pub fn client(&self) -> &CatalogClient {
        &self.client
    }

    fn release_for_version(&self, slug: &str, version: &str) -> FetchResult<Release> {
        let not_found = |reason: String| FetchError::ReleaseNotFound {
            slug: slug.to_string(),
            version: version.to_string(),
            reason,
        };

        let releases = self.client.releases(slug).map_err(|e| not_found(e.to_string()))?;
        releases
            .into_iter()
            .find(|release| release.version == version)
            .ok_or_else(|| not_found("no release with this version".to_string()))
    }

    fn catalog_file<'a>(&self, artifact: &'a ArtifactRef) -> FetchResult<&'a CatalogFile> {
        match artifact {
            ArtifactRef::Catalog(file) => Ok(file),
            other => Err(FetchError::UnsupportedArtifact {
                backend: self.name().to_string(),
                artifact: other.to_string(),
            }),
        }
    }
}

impl ArtifactSource for CatalogSource {
    fn name(&self) -> &str {
        "pivnet"
    }

    fn list_versions(&self, slug: &str) -> FetchResult<Vec<String>> {
        let releases = self.client.releases(slug)?;
        Ok(releases.into_iter().map(|release| release.version).collect())
    }

    fn resolve_file(&self, slug: &str, version: &str, glob: &str) -> FetchResult<ArtifactRef> {
        let release = self.release_for_version(slug, version)?;

        self.client
            .accept_eula(slug, release.id)
            .map_err(|e| FetchError::EulaRejected {
                slug: slug.to_string(),
                version: version.to_string(),
                reason: e.to_string(),
            })?;

        let files = self.client.product_files(slug, release.id)?;
        let pattern = compile_glob(glob)?;
        let available: Vec<String> = files.iter().map(|f| base_name(&f.aws_object_key).to_string()).collect();
        let matches = files
            .into_iter()
            .filter(|file| pattern.matches(base_name(&file.aws_object_key)))
            .map(|file| (base_name(&file.aws_object_key).to_string(), file))
            .collect();
        let file = single_match(glob, matches, &available)?;

        tracing::debug!(slug, version, file = %file.aws_object_key, "resolved catalog file");
        Ok(ArtifactRef::Catalog(CatalogFile {
            slug: slug.to_string(),
            release_id: release.id,
            release_version: release.version,
            product_file_id: file.id,
            object_key: file.aws_object_key,
            sha256: file.sha256.filter(|sha| !sha.is_empty()),
        }))
    }

    fn download(&self, artifact: &ArtifactRef, destination: &Path, meter: &ProgressMeter) -> FetchResult<()> {
        let file = self.catalog_file(artifact)?;
        let client = &self.client;
        let links = move || client.download_link(&file.slug, file.release_id, file.product_file_id);

        let report = self.downloader.download(&links, destination, meter)?;
        tracing::info!(
            slug = %file.slug,
            file = %artifact.file_name(),
            bytes = report.content_length,
            "downloaded product file"
        );
        Ok(())
    }

    fn stemcell_for(
        &self,
        artifact: &ArtifactRef,
        downloaded: &Path,
        slug_hint: Option<&str>,
    ) -> FetchResult<StemcellDependency> {
        let file = self.catalog_file(artifact)?;
        let dependencies = self.client.dependencies(&file.slug, file.release_id)?;

        let stemcells: Vec<(String, String)> = dependencies
            .into_iter()
            .map(|dependency| (dependency.release.product.slug, dependency.release.version))
            .filter(|(slug, _)| slug.contains(STEMCELL_SLUG_MARKER))
            .filter(|(slug, _)| slug_hint.map_or(true, |hint| slug == hint))
            .collect();

        let slugs: BTreeSet<&str> = stemcells.iter().map(|(slug, _)| slug.as_str()).collect();
        let stemcell_slug = match slugs.len() {
            0 => {
                return Err(FetchError::NoCompatibleStemcell {
                    slug: slug_hint.unwrap_or(STEMCELL_SLUG_MARKER).to_string(),
                    version: "any version".to_string(),
                    reason: format!(
                        "{} {} declares no matching stemcell dependency",
                        file.slug, file.release_version
                    ),
                })
            }
            1 => slugs.into_iter().next().unwrap_or_default().to_string(),
            _ => {
                return Err(FetchError::AmbiguousStemcell {
                    slug: file.slug.clone(),
                    slugs: slugs.into_iter().map(str::to_string).collect(),
                })
            }
        };

        let versions: Vec<String> = stemcells
            .into_iter()
            .filter(|(slug, _)| *slug == stemcell_slug)
            .map(|(_, version)| version)
            .collect();

        // The tile's own criterion narrows the declared range when it can be read.
        let required = match read_tile_metadata(downloaded) {
            Ok(metadata) => metadata.stemcell_criteria.map(|criteria| criteria.version),
            Err(e) => {
                tracing::debug!(error = %e, "no tile metadata, using declared stemcell dependencies only");
                None
            }
        };

        let version = match required {
            Some(required) => latest_compatible(&stemcell_slug, &required, &versions)?,
            None => latest_version(&versions)?.ok_or_else(|| FetchError::NoCompatibleStemcell {
                slug: stemcell_slug.clone(),
                version: "any version".to_string(),
                reason: "no versions declared".to_string(),
            })?,
        };

        tracing::info!(slug = %stemcell_slug, version = %version, "selected stemcell");
        Ok(StemcellDependency::new(stemcell_slug, version))
    }

    fn tile_metadata(&self, artifact: &ArtifactRef) -> FetchResult<TileMetadata> {
        let file = self.catalog_file(artifact)?;
        let link = self
            .client
            .download_link(&file.slug, file.release_id, file.product_file_id)?;
        fetch_tile_metadata(self.transport.clone(), &link, &self.downloader.settings().referer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn source(server: &mockito::Server) -> CatalogSource {
        let clients = Arc::new(HttpClients::direct().unwrap());
        let client = CatalogClient::new(server.url(), Arc::new(StaticToken::bearer("t")), clients.clone());
        CatalogSource::new(client, clients, DownloadSettings::default())
    }

    fn mock_release(server: &mut mockito::Server) {
        server
            .mock("GET", "/api/v2/products/example/releases")
            .with_status(200)
            .with_body(r#"{"releases":[{"id":7,"version":"1.0.0"}]}"#)
            .create();
    }

    #[test]
    fn test_resolve_file_accepts_eula_and_globs() {
        let mut server = mockito::Server::new();
        mock_release(&mut server);
        let eula = server
            .mock("POST", "/api/v2/products/example/releases/7/pivnet_resource_eula_acceptance")
            .with_status(200)
            .create();
        server
            .mock("GET", "/api/v2/products/example/releases/7/product_files")
            .with_status(200)
            .with_body(
                r#"{"product_files":[
                    {"id":1,"aws_object_key":"files/example-1.0.0.pivotal","sha256":"aa"},
                    {"id":2,"aws_object_key":"files/example-1.0.0.tgz","sha256":""}
                ]}"#,
            )
            .create();

        let artifact = source(&server).resolve_file("example", "1.0.0", "*.pivotal").unwrap();
        eula.assert();
        match artifact {
            ArtifactRef::Catalog(file) => {
                assert_eq!(file.product_file_id, 1);
                assert_eq!(file.release_id, 7);
                assert_eq!(file.sha256.as_deref(), Some("aa"));
            }
            other => panic!("unexpected artifact {:?}", other),
        }
    }

    #[test]
    fn test_resolve_file_missing_release() {
        let mut server = mockito::Server::new();
        mock_release(&mut server);

        let err = source(&server).resolve_file("example", "9.9.9", "*").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReleaseNotFound);
        assert!(err.to_string().contains("example 9.9.9"));
    }

    #[test]
    fn test_resolve_file_eula_rejected() {
        let mut server = mockito::Server::new();
        mock_release(&mut server);
        server
            .mock("POST", "/api/v2/products/example/releases/7/pivnet_resource_eula_acceptance")
            .with_status(403)
            .create();

        let err = source(&server).resolve_file("example", "1.0.0", "*").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EulaRejected);
    }

    #[test]
    fn test_stemcell_for_ambiguous_without_hint() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/api/v2/products/example/releases/7/dependencies")
            .with_status(200)
            .with_body(
                r#"{"dependencies":[
                    {"release":{"version":"97.28","product":{"slug":"stemcells-ubuntu-xenial"}}},
                    {"release":{"version":"2019.7","product":{"slug":"stemcells-windows-server"}}},
                    {"release":{"version":"1.2","product":{"slug":"some-buildpack"}}}
                ]}"#,
            )
            .create();

        let artifact = ArtifactRef::Catalog(CatalogFile {
            slug: "example".to_string(),
            release_id: 7,
            release_version: "1.0.0".to_string(),
            product_file_id: 1,
            object_key: "example.pivotal".to_string(),
            sha256: None,
        });
        let source = source(&server);
        let missing = Path::new("/nonexistent/example.pivotal");

        let err = source.stemcell_for(&artifact, missing, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AmbiguousStemcell);
        assert!(err.to_string().contains("stemcells-ubuntu-xenial, stemcells-windows-server"));

        let stemcell = source
            .stemcell_for(&artifact, missing, Some("stemcells-windows-server"))
            .unwrap();
        assert_eq!(stemcell, StemcellDependency::new("stemcells-windows-server", "2019.7"));
    }
}
