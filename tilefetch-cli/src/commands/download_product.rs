//! Download product command - fetch a product file and, optionally, its stemcell.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tilefetch::config::ConfigFile;
use tilefetch::download::DownloadSettings;
use tilefetch::http::HttpClients;
use tilefetch::source::blob::{BlobSource, LocalBlobStore, S3BlobStore};
use tilefetch::source::catalog::{token_source, CatalogClient, CatalogSource, DEFAULT_HOST};
use tilefetch::source::ArtifactSource;
use tilefetch::version::VersionSpec;
use tilefetch::{AcquireRequest, Acquirer, StemcellRequest};
use tokio_util::sync::CancellationToken;

use super::common::{bucket_signer, http_clients, BucketAuthArgs, ProxyArgs, SourceKind};
use crate::error::CliError;
use crate::progress::progress_bars;

/// Arguments for the download-product command.
#[derive(Debug, Args)]
#[command(group(
    clap::ArgGroup::new("version")
        .required(true)
        .args(["product_version", "product_version_regex"]),
))]
pub struct DownloadProductArgs {
    /// Where to download from (defaults to [blobstore] kind, else pivnet)
    #[arg(long, value_enum)]
    pub source: Option<SourceKind>,

    /// Product slug
    #[arg(long)]
    pub pivnet_product_slug: String,

    /// Exact product version
    #[arg(long)]
    pub product_version: Option<String>,

    /// Regex selecting the highest matching product version
    #[arg(long)]
    pub product_version_regex: Option<String>,

    /// Glob matching exactly one file of the release
    #[arg(long)]
    pub file_glob: String,

    /// Directory to download into
    #[arg(long)]
    pub output_directory: PathBuf,

    /// Also download a stemcell for this IaaS
    #[arg(long)]
    pub stemcell_iaas: Option<String>,

    /// Stemcell version instead of the latest compatible one
    #[arg(long, requires = "stemcell_iaas")]
    pub stemcell_version: Option<String>,

    /// Require a heavy (full) stemcell
    #[arg(long, requires = "stemcell_iaas")]
    pub stemcell_heavy: bool,

    /// Stemcell product slug, when the product depends on several
    #[arg(long, requires = "stemcell_iaas")]
    pub stemcell_slug: Option<String>,

    /// Directory for the stemcell (defaults to the output directory)
    #[arg(long, requires = "stemcell_iaas")]
    pub stemcell_output_directory: Option<PathBuf>,

    /// Prefix downloaded file names with [slug,version]
    #[arg(long)]
    pub blobstore_prefix: bool,

    /// Remove older downloads matching the glob from the output directory
    #[arg(long)]
    pub cleanup_cache: bool,

    /// Blob store root: a directory, or a bucket URL for s3
    #[arg(long)]
    pub blobstore_root: Option<String>,

    /// Blob store directory holding products
    #[arg(long)]
    pub blobstore_product_path: Option<String>,

    /// Blob store directory holding stemcells
    #[arg(long)]
    pub blobstore_stemcell_path: Option<String>,

    /// Catalog API token
    #[arg(long, env = "PIVNET_TOKEN", hide_env_values = true)]
    pub pivnet_token: Option<String>,

    /// Catalog host
    #[arg(long)]
    pub pivnet_host: Option<String>,

    /// Maximum number of concurrent range requests
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Fixed range size in bytes
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Do not draw progress bars
    #[arg(long)]
    pub no_progress: bool,

    #[command(flatten)]
    pub bucket_auth: BucketAuthArgs,

    #[command(flatten)]
    pub proxy: ProxyArgs,
}

/// Run the download-product command.
pub fn run(args: DownloadProductArgs, config: &ConfigFile, cancel: CancellationToken) -> Result<(), CliError> {
    let version = VersionSpec::from_options(args.product_version.as_deref(), args.product_version_regex.as_deref())
        .ok_or_else(|| {
            CliError::Config("Either --product-version or --product-version-regex is required".to_string())
        })?;

    let mut settings = config.download_settings().with_cancellation(cancel);
    if let Some(max) = args.max_concurrency {
        settings = settings.with_max_concurrency(max);
    }
    if let Some(size) = args.chunk_size {
        settings = settings.with_chunk_size(size);
    }

    let clients = http_clients(&settings, &args.proxy, config)?;
    let kind = args
        .source
        .or_else(|| SourceKind::from_config(config))
        .unwrap_or(SourceKind::Pivnet);
    let source = build_source(kind, &args, config, clients, settings)?;

    let mut request = AcquireRequest::new(
        &args.pivnet_product_slug,
        version,
        &args.file_glob,
        &args.output_directory,
    )
    .with_blob_prefix(args.blobstore_prefix)
    .with_cleanup_cache(args.cleanup_cache);

    if let Some(iaas) = &args.stemcell_iaas {
        let mut stemcell = StemcellRequest::new(iaas).with_heavy(args.stemcell_heavy);
        if let Some(version) = &args.stemcell_version {
            stemcell = stemcell.with_version(version);
        }
        if let Some(slug) = &args.stemcell_slug {
            stemcell = stemcell.with_slug(slug);
        }
        if let Some(dir) = &args.stemcell_output_directory {
            stemcell = stemcell.with_output_dir(dir);
        }
        request = request.with_stemcell(stemcell);
    }

    let mut acquirer = Acquirer::new(source);
    if !args.no_progress {
        acquirer = acquirer.with_progress(progress_bars());
    }

    let outcome = acquirer.acquire(&request)?;
    let written = outcome.write_to(&args.output_directory)?;

    println!("Downloaded {} {}", outcome.product_slug, outcome.product_version);
    println!("  Product:  {}", outcome.product_path.display());
    if let (Some(path), Some(version)) = (&outcome.stemcell_path, &outcome.stemcell_version) {
        println!("  Stemcell: {} ({})", path.display(), version);
    }
    for path in written {
        println!("  Wrote:    {}", path.display());
    }
    Ok(())
}

fn build_source(
    kind: SourceKind,
    args: &DownloadProductArgs,
    config: &ConfigFile,
    clients: Arc<HttpClients>,
    settings: DownloadSettings,
) -> Result<Arc<dyn ArtifactSource>, CliError> {
    if kind == SourceKind::Pivnet {
        let host = args
            .pivnet_host
            .clone()
            .or_else(|| config.catalog.host.clone())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let token = args
            .pivnet_token
            .clone()
            .or_else(|| config.catalog.token.clone())
            .ok_or_else(|| {
                CliError::Config(
                    "A catalog token is required. Use --pivnet-token or set token in config.ini [catalog] section."
                        .to_string(),
                )
            })?;

        let client = CatalogClient::new(&host, token_source(&host, &token, clients.clone()), clients.clone());
        return Ok(Arc::new(CatalogSource::new(client, clients, settings)));
    }

    let root = args
        .blobstore_root
        .clone()
        .or_else(|| config.blobstore.root.clone())
        .ok_or_else(|| {
            CliError::Config(
                "A blob store root is required. Use --blobstore-root or set root in config.ini [blobstore] section."
                    .to_string(),
            )
        })?;

    let source = if kind == SourceKind::S3 {
        let auth = args.bucket_auth.resolve(&config.blobstore)?;
        let mut store = S3BlobStore::new(&root, clients)?;
        if let Some(signer) = bucket_signer(&auth, &settings)? {
            store = store.with_signer(signer);
        }
        let transport = store.transport();
        BlobSource::new(Arc::new(store), settings).with_transport(transport)
    } else {
        BlobSource::new(Arc::new(LocalBlobStore::new(root)), settings)
    };

    let product_path = args
        .blobstore_product_path
        .clone()
        .or_else(|| config.blobstore.product_path.clone())
        .unwrap_or_default();
    let stemcell_path = args
        .blobstore_stemcell_path
        .clone()
        .or_else(|| config.blobstore.stemcell_path.clone())
        .unwrap_or_default();

    Ok(Arc::new(
        source.with_product_path(product_path).with_stemcell_path(stemcell_path),
    ))
}
