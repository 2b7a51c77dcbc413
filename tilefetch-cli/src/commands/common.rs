//! Common types and utilities shared across CLI commands.

use std::path::Path;
use std::sync::Arc;

use clap::{Args, ValueEnum};
use tilefetch::config::{BlobstoreKind, BlobstoreSection, ConfigFile};
use tilefetch::download::DownloadSettings;
use tilefetch::http::HttpClients;
use tilefetch::proxy::{ProxyAuth, ProxyAuthRegistry, ProxyAuthType, ProxyConfig};
use tilefetch::source::blob::{credentials_provider, S3AuthType, SigV4Signer};

use crate::error::CliError;

/// Where artifacts come from.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum SourceKind {
    /// The catalog API
    Pivnet,
    /// A local directory laid out as a blob store
    Local,
    /// An S3-compatible bucket
    S3,
}

impl SourceKind {
    /// Source implied by the `[blobstore]` section, if any.
    pub fn from_config(config: &ConfigFile) -> Option<Self> {
        config.blobstore.kind.map(|kind| match kind {
            BlobstoreKind::Local => SourceKind::Local,
            BlobstoreKind::S3 => SourceKind::S3,
        })
    }
}

/// Proxy flags, overriding the `[proxy]` section.
#[derive(Debug, Clone, Default, Args)]
pub struct ProxyArgs {
    /// Proxy URL for all outbound requests
    #[arg(long)]
    pub proxy_url: Option<String>,

    /// Proxy username
    #[arg(long)]
    pub proxy_username: Option<String>,

    /// Proxy password
    #[arg(long)]
    pub proxy_password: Option<String>,

    /// Kerberos domain; implies SPNEGO authentication
    #[arg(long)]
    pub proxy_domain: Option<String>,

    /// Proxy authentication type: none, basic or spnego
    #[arg(long)]
    pub proxy_auth_type: Option<String>,
}

impl ProxyArgs {
    /// Merge the flags over `base`.
    pub fn resolve(&self, base: &ProxyConfig) -> Result<ProxyConfig, CliError> {
        let mut proxy = base.clone();
        if let Some(url) = &self.proxy_url {
            proxy.url = url.clone();
        }
        if let Some(username) = &self.proxy_username {
            proxy.username = username.clone();
        }
        if let Some(password) = &self.proxy_password {
            proxy.password = password.clone();
        }
        if let Some(domain) = &self.proxy_domain {
            proxy.domain = domain.clone();
        }
        if let Some(auth_type) = &self.proxy_auth_type {
            proxy.auth_type = Some(auth_type.parse::<ProxyAuthType>()?);
        }
        Ok(proxy)
    }
}

/// Bucket credential flags, overriding the `[blobstore]` section.
#[derive(Debug, Clone, Default, Args)]
pub struct BucketAuthArgs {
    /// Bucket authentication: anonymous, accesskey or iam
    #[arg(long)]
    pub blobstore_auth_type: Option<String>,

    /// Access key id for accesskey authentication
    #[arg(long)]
    pub blobstore_access_key_id: Option<String>,

    /// Secret access key for accesskey authentication
    #[arg(long, env = "BLOBSTORE_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub blobstore_secret_access_key: Option<String>,

    /// Bucket region used for signing
    #[arg(long)]
    pub blobstore_region: Option<String>,
}

impl BucketAuthArgs {
    /// Merge the flags over `base`.
    pub fn resolve(&self, base: &BlobstoreSection) -> Result<BlobstoreSection, CliError> {
        let mut section = base.clone();
        if let Some(auth_type) = &self.blobstore_auth_type {
            section.auth_type = Some(auth_type.parse::<S3AuthType>()?);
        }
        if let Some(id) = &self.blobstore_access_key_id {
            section.access_key_id = Some(id.clone());
        }
        if let Some(secret) = &self.blobstore_secret_access_key {
            section.secret_access_key = Some(secret.clone());
        }
        if let Some(region) = &self.blobstore_region {
            section.region = Some(region.clone());
        }
        Ok(section)
    }
}

/// The request signer for the bucket, `None` for anonymous access.
pub fn bucket_signer(
    section: &BlobstoreSection,
    settings: &DownloadSettings,
) -> Result<Option<Arc<SigV4Signer>>, CliError> {
    let auth_type = section.effective_auth_type();
    // The metadata service is link-local and never reached through the proxy.
    let metadata_clients = Arc::new(HttpClients::new(
        settings.head_timeout,
        settings.inactivity_timeout,
        ProxyAuth::none(),
    )?);
    let provider = credentials_provider(
        auth_type,
        section.access_key_id.as_deref(),
        section.secret_access_key.as_deref(),
        metadata_clients,
    )?;

    Ok(provider.map(|provider| {
        tracing::info!(auth_type = %auth_type, region = section.effective_region(), "signing bucket requests");
        Arc::new(SigV4Signer::new(section.effective_region(), provider))
    }))
}

/// Load the configuration file: an explicit path, else the default location.
pub fn load_config(path: Option<&Path>) -> Result<ConfigFile, CliError> {
    let config = match path {
        Some(path) => {
            if !path.exists() {
                return Err(CliError::Config(format!(
                    "Configuration file {} does not exist",
                    path.display()
                )));
            }
            ConfigFile::load_from(path)?
        }
        None => ConfigFile::load()?,
    };
    Ok(config)
}

/// Build the shared HTTP clients with the resolved proxy.
pub fn http_clients(
    settings: &DownloadSettings,
    proxy_args: &ProxyArgs,
    config: &ConfigFile,
) -> Result<Arc<HttpClients>, CliError> {
    let proxy = proxy_args.resolve(&config.proxy)?;
    let auth = ProxyAuthRegistry::with_builtins().configure(&proxy)?;
    if let Some(url) = auth.url() {
        tracing::info!(proxy = url.host_str().unwrap_or_default(), auth_type = %auth.auth_type(), "using proxy");
    }
    Ok(Arc::new(HttpClients::new(
        settings.head_timeout,
        settings.inactivity_timeout,
        auth,
    )?))
}
