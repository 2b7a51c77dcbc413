//! INI configuration file.
//!
//! Located at `$XDG_CONFIG_HOME/tilefetch/config.ini` unless a path is given.
//! A missing file yields the defaults. Every key is optional; command line
//! flags override whatever is set here.
//!
//! ```ini
//! [download]
//! chunk_size = 104857600
//! max_concurrency = 10
//! inactivity_timeout_secs = 5
//! head_timeout_secs = 30
//! retry_delay_ms = 250
//! referer = https://go-pivnet.network.pivotal.io
//!
//! [catalog]
//! host = https://network.pivotal.io
//! token = ...
//!
//! [blobstore]
//! kind = s3
//! root = https://s3.example.com/mirror
//! product_path = products
//! stemcell_path = stemcells
//! auth_type = accesskey
//! access_key_id = AKIA...
//! secret_access_key = ...
//! region = eu-central-1
//!
//! [proxy]
//! url = http://proxy.internal:3128
//! username = jdoe
//! password = ...
//! domain = EXAMPLE.COM
//! auth_type = spnego
//!
//! [logging]
//! level = info
//! file = /var/log/tilefetch.log
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};

use crate::download::DownloadSettings;
use crate::error::{FetchError, FetchResult};
use crate::proxy::{ProxyAuthType, ProxyConfig};
use crate::source::blob::{S3AuthType, DEFAULT_REGION};

/// Directory under the user config dir holding our files.
pub const CONFIG_DIR_NAME: &str = "tilefetch";

/// Name of the configuration file.
pub const CONFIG_FILE_NAME: &str = "config.ini";

/// Default location of the configuration file, if a config dir is known.
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Engine parameters; unset keys keep the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSection {
    pub chunk_size: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub inactivity_timeout_secs: Option<u64>,
    pub head_timeout_secs: Option<u64>,
    pub retry_delay_ms: Option<u64>,
    pub referer: Option<String>,
}

impl DownloadSection {
    /// Apply the configured values on top of `settings`.
    pub fn apply(&self, mut settings: DownloadSettings) -> DownloadSettings {
        if let Some(size) = self.chunk_size {
            settings = settings.with_chunk_size(size);
        }
        if let Some(max) = self.max_concurrency {
            settings = settings.with_max_concurrency(max);
        }
        if let Some(secs) = self.inactivity_timeout_secs {
            settings = settings.with_inactivity_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.head_timeout_secs {
            settings = settings.with_head_timeout(Duration::from_secs(secs));
        }
        if let Some(ms) = self.retry_delay_ms {
            settings = settings.with_retry_delay(Duration::from_millis(ms));
        }
        if let Some(referer) = &self.referer {
            settings = settings.with_referer(referer.clone());
        }
        settings
    }
}

/// Catalog API access.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CatalogSection {
    pub host: Option<String>,
    pub token: Option<String>,
}

impl fmt::Debug for CatalogSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogSection")
            .field("host", &self.host)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Kind of blob store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobstoreKind {
    Local,
    S3,
}

impl FromStr for BlobstoreKind {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            other => Err(FetchError::Config(format!(
                "[blobstore] kind must be local or s3, got {:?}",
                other
            ))),
        }
    }
}

/// Blob store location, layout and bucket credentials.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BlobstoreSection {
    pub kind: Option<BlobstoreKind>,
    /// Directory for `local`, bucket URL for `s3`.
    pub root: Option<String>,
    pub product_path: Option<String>,
    pub stemcell_path: Option<String>,
    pub auth_type: Option<S3AuthType>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: Option<String>,
}

impl fmt::Debug for BlobstoreSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobstoreSection")
            .field("kind", &self.kind)
            .field("root", &self.root)
            .field("product_path", &self.product_path)
            .field("stemcell_path", &self.stemcell_path)
            .field("auth_type", &self.auth_type)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .finish()
    }
}

impl BlobstoreSection {
    /// `auth_type` if set, else `accesskey` when an access key id is
    /// configured and `anonymous` otherwise.
    pub fn effective_auth_type(&self) -> S3AuthType {
        match (self.auth_type, &self.access_key_id) {
            (Some(auth_type), _) => auth_type,
            (None, Some(_)) => S3AuthType::AccessKey,
            (None, None) => S3AuthType::Anonymous,
        }
    }

    /// Signing region of the bucket.
    pub fn effective_region(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_REGION)
    }
}

/// Log output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub file: Option<PathBuf>,
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub download: DownloadSection,
    pub catalog: CatalogSection,
    pub blobstore: BlobstoreSection,
    pub proxy: ProxyConfig,
    pub logging: LoggingSection,
}

impl ConfigFile {
    /// Load from the default location.
    pub fn load() -> FetchResult<Self> {
        match config_file_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> FetchResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path)
            .map_err(|e| FetchError::Config(format!("could not read {}: {}", path.display(), e)))?;
        Self::from_ini(&ini)
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> FetchResult<Self> {
        let ini = Ini::load_from_str(text).map_err(|e| FetchError::Config(e.to_string()))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> FetchResult<Self> {
        let section = |name: &'static str| Section {
            name,
            properties: ini.section(Some(name)),
        };

        let download = section("download");
        let catalog = section("catalog");
        let blobstore = section("blobstore");
        let proxy = section("proxy");
        let logging = section("logging");

        Ok(Self {
            download: DownloadSection {
                chunk_size: download.number("chunk_size")?,
                max_concurrency: download.number("max_concurrency")?,
                inactivity_timeout_secs: download.number("inactivity_timeout_secs")?,
                head_timeout_secs: download.number("head_timeout_secs")?,
                retry_delay_ms: download.number("retry_delay_ms")?,
                referer: download.string("referer"),
            },
            catalog: CatalogSection {
                host: catalog.string("host"),
                token: catalog.string("token"),
            },
            blobstore: BlobstoreSection {
                kind: blobstore.string("kind").map(|kind| kind.parse()).transpose()?,
                root: blobstore.string("root"),
                product_path: blobstore.string("product_path"),
                stemcell_path: blobstore.string("stemcell_path"),
                auth_type: blobstore.string("auth_type").map(|tag| tag.parse()).transpose()?,
                access_key_id: blobstore.string("access_key_id"),
                secret_access_key: blobstore.string("secret_access_key"),
                region: blobstore.string("region"),
            },
            proxy: ProxyConfig {
                url: proxy.string("url").unwrap_or_default(),
                username: proxy.string("username").unwrap_or_default(),
                password: proxy.string("password").unwrap_or_default(),
                domain: proxy.string("domain").unwrap_or_default(),
                auth_type: proxy
                    .string("auth_type")
                    .map(|tag| tag.parse::<ProxyAuthType>())
                    .transpose()?,
            },
            logging: LoggingSection {
                level: logging.string("level"),
                file: logging.string("file").map(PathBuf::from),
            },
        })
    }

    /// Engine settings with the `[download]` values applied.
    pub fn download_settings(&self) -> DownloadSettings {
        self.download.apply(DownloadSettings::default())
    }
}

struct Section<'a> {
    name: &'static str,
    properties: Option<&'a Properties>,
}

impl Section<'_> {
    /// Non-empty, trimmed value of `key`.
    fn string(&self, key: &str) -> Option<String> {
        self.properties
            .and_then(|properties| properties.get(key))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn number<T: FromStr>(&self, key: &str) -> FetchResult<Option<T>>
    where
        T::Err: fmt::Display,
    {
        self.string(key)
            .map(|value| {
                value.parse::<T>().map_err(|e| {
                    FetchError::Config(format!("[{}] {} = {:?}: {}", self.name, key, value, e))
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_sections() {
        let config = ConfigFile::parse(
            r#"
[download]
chunk_size = 1048576
max_concurrency = 4
inactivity_timeout_secs = 9
retry_delay_ms = 10
referer = https://example.com

[catalog]
host = https://catalog.example.com
token = secret

[blobstore]
kind = S3
root = https://s3.example.com/mirror
product_path = products

[proxy]
url = http://proxy:3128
domain = EXAMPLE.COM

[logging]
level = debug
file = /tmp/tilefetch.log
"#,
        )
        .unwrap();

        assert_eq!(config.download.chunk_size, Some(1_048_576));
        assert_eq!(config.catalog.token.as_deref(), Some("secret"));
        assert_eq!(config.blobstore.kind, Some(BlobstoreKind::S3));
        assert_eq!(config.blobstore.stemcell_path, None);
        assert_eq!(config.proxy.selected_auth_type(), ProxyAuthType::Spnego);
        assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/tilefetch.log")));
        assert!(!format!("{:?}", config.catalog).contains("secret"));

        let settings = config.download_settings();
        assert_eq!(settings.max_concurrency, 4);
        assert_eq!(settings.inactivity_timeout, Duration::from_secs(9));
        assert_eq!(settings.retry_delay, Duration::from_millis(10));
        assert_eq!(settings.head_timeout, crate::download::DEFAULT_HEAD_TIMEOUT);
        assert_eq!(settings.referer, "https://example.com");
    }

    #[test]
    fn test_invalid_number_names_section_and_key() {
        let err = ConfigFile::parse("[download]\nmax_concurrency = lots\n").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        assert!(err.to_string().contains("[download] max_concurrency"));
    }

    #[test]
    fn test_invalid_blobstore_kind() {
        let err = ConfigFile::parse("[blobstore]\nkind = ftp\n").unwrap_err();
        assert!(err.to_string().contains("local or s3"));
    }

    #[test]
    fn test_blobstore_credentials() {
        let config = ConfigFile::parse(
            "[blobstore]\nkind = s3\nauth_type = AccessKey\naccess_key_id = AKID\nsecret_access_key = hunter2\nregion = eu-west-1\n",
        )
        .unwrap();
        assert_eq!(config.blobstore.auth_type, Some(S3AuthType::AccessKey));
        assert_eq!(config.blobstore.access_key_id.as_deref(), Some("AKID"));
        assert_eq!(config.blobstore.region.as_deref(), Some("eu-west-1"));
        assert!(!format!("{:?}", config.blobstore).contains("hunter2"));

        let implied = ConfigFile::parse("[blobstore]\naccess_key_id = AKID\n").unwrap();
        assert_eq!(implied.blobstore.effective_auth_type(), S3AuthType::AccessKey);
        assert_eq!(implied.blobstore.effective_region(), DEFAULT_REGION);
        assert_eq!(BlobstoreSection::default().effective_auth_type(), S3AuthType::Anonymous);

        let err = ConfigFile::parse("[blobstore]\nauth_type = token\n").unwrap_err();
        assert!(err.to_string().contains("anonymous, accesskey or iam"));
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = ConfigFile::load_from(&temp.path().join("absent.ini")).unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_load_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[catalog]\nhost = http://localhost:1\n").unwrap();

        let config = ConfigFile::load_from(&path).unwrap();
        assert_eq!(config.catalog.host.as_deref(), Some("http://localhost:1"));
        assert_eq!(config.download_settings().max_concurrency, crate::download::DEFAULT_MAX_CONCURRENCY);
    }
}
