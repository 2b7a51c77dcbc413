//! Proxy authentication.
//!
//! A [`ProxyAuthRegistry`] maps auth-type tags to factories producing a
//! [`ProxyAuthenticator`]. Configuring the registry with a [`ProxyConfig`]
//! yields a [`ProxyAuth`], which [`crate::http::HttpClients`] turns into the
//! `reqwest::Proxy` of every client it builds. No other module touches proxy
//! settings.
//!
//! Selection order for the auth type:
//!
//! 1. empty proxy URL: no proxy at all
//! 2. explicit `auth_type`
//! 3. non-empty domain: `spnego`
//! 4. username or password: `basic`
//! 5. otherwise: proxy without authentication
//!
//! When SPNEGO cannot be initialised the layer logs a warning and falls back
//! to basic authentication.

mod basic;
mod spnego;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use reqwest::header::HeaderValue;
use reqwest::Url;

use crate::error::{FetchError, FetchResult};

pub use basic::BasicAuthenticator;
#[cfg(feature = "spnego")]
pub use spnego::KerberosTokenProvider;
pub use spnego::{krb5_config_path, NegotiateTokenProvider, SpnegoAuthenticator};

/// Proxy authentication mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyAuthType {
    None,
    Basic,
    Spnego,
}

impl ProxyAuthType {
    /// Registry tag for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Spnego => "spnego",
        }
    }
}

impl fmt::Display for ProxyAuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyAuthType {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "basic" => Ok(Self::Basic),
            "spnego" => Ok(Self::Spnego),
            other => Err(FetchError::ProxyAuth(format!(
                "unknown proxy authentication type: {}",
                other
            ))),
        }
    }
}

/// Proxy settings as given by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub domain: String,
    pub auth_type: Option<ProxyAuthType>,
}

impl ProxyConfig {
    /// Proxy at `url` with no credentials.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the username and password.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the Kerberos domain (realm).
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Force an auth type instead of inferring one.
    pub fn with_auth_type(mut self, auth_type: ProxyAuthType) -> Self {
        self.auth_type = Some(auth_type);
        self
    }

    /// The auth type that applies to this configuration.
    pub fn selected_auth_type(&self) -> ProxyAuthType {
        if self.url.is_empty() {
            ProxyAuthType::None
        } else if let Some(auth_type) = self.auth_type {
            auth_type
        } else if !self.domain.is_empty() {
            ProxyAuthType::Spnego
        } else if !self.username.is_empty() || !self.password.is_empty() {
            ProxyAuthType::Basic
        } else {
            ProxyAuthType::None
        }
    }
}

/// An authentication mechanism for an HTTP proxy.
pub trait ProxyAuthenticator: Send + Sync {
    fn auth_type(&self) -> ProxyAuthType;

    /// Adjust the proxy URL before clients are built.
    fn prepare_url(&self, _url: &mut Url) -> FetchResult<()> {
        Ok(())
    }

    /// Value of the `Proxy-Authorization` header, if the mechanism sends one.
    fn authorization(&self, _proxy_host: &str) -> FetchResult<Option<String>> {
        Ok(None)
    }

    /// Drop cached credentials after a 407. Returns `true` when retrying
    /// with fresh credentials may succeed.
    fn invalidate(&self, _proxy_host: &str) -> bool {
        false
    }
}

/// A proxy that needs no credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthenticator;

impl ProxyAuthenticator for NoAuthenticator {
    fn auth_type(&self) -> ProxyAuthType {
        ProxyAuthType::None
    }
}

/// Builds an authenticator from the proxy settings.
pub type ProxyAuthFactory =
    Box<dyn Fn(&ProxyConfig) -> FetchResult<Arc<dyn ProxyAuthenticator>> + Send + Sync>;

/// Registry of proxy authentication mechanisms keyed by tag.
pub struct ProxyAuthRegistry {
    factories: HashMap<String, ProxyAuthFactory>,
}

impl Default for ProxyAuthRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ProxyAuthRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry holding the `none`, `basic` and `spnego` mechanisms.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            ProxyAuthType::None.as_str(),
            Box::new(|_: &ProxyConfig| Ok(Arc::new(NoAuthenticator) as Arc<dyn ProxyAuthenticator>)),
        );
        registry.register(
            ProxyAuthType::Basic.as_str(),
            Box::new(|config: &ProxyConfig| {
                Ok(Arc::new(BasicAuthenticator::from_config(config)) as Arc<dyn ProxyAuthenticator>)
            }),
        );
        registry.register(
            ProxyAuthType::Spnego.as_str(),
            Box::new(|config: &ProxyConfig| {
                Ok(Arc::new(SpnegoAuthenticator::from_config(config)?) as Arc<dyn ProxyAuthenticator>)
            }),
        );
        registry
    }

    /// Register a factory under `tag` (case-insensitive).
    pub fn register(&mut self, tag: &str, factory: ProxyAuthFactory) {
        self.factories.insert(tag.to_ascii_lowercase(), factory);
    }

    fn build(&self, auth_type: ProxyAuthType, config: &ProxyConfig) -> FetchResult<Arc<dyn ProxyAuthenticator>> {
        let factory = self.factories.get(auth_type.as_str()).ok_or_else(|| {
            FetchError::ProxyAuth(format!(
                "no handler registered for proxy authentication type: {}",
                auth_type
            ))
        })?;
        factory(config)
    }

    /// Resolve `config` into the proxy settings used by every HTTP client.
    pub fn configure(&self, config: &ProxyConfig) -> FetchResult<ProxyAuth> {
        if config.url.is_empty() {
            return Ok(ProxyAuth::none());
        }

        let mut url = Url::parse(&config.url)
            .map_err(|e| FetchError::Config(format!("invalid proxy url {:?}: {}", config.url, e)))?;

        let auth_type = config.selected_auth_type();
        let authenticator = match auth_type {
            ProxyAuthType::None | ProxyAuthType::Basic => self.build(auth_type, config)?,
            ProxyAuthType::Spnego => match self.build(ProxyAuthType::Spnego, config) {
                Ok(authenticator) => authenticator,
                Err(e) => {
                    tracing::warn!(error = %e, "SPNEGO proxy authentication unavailable, falling back to basic");
                    self.build(ProxyAuthType::Basic, config)?
                }
            },
        };

        authenticator.prepare_url(&mut url)?;

        tracing::debug!(proxy = %redacted(&url), auth = %authenticator.auth_type(), "proxy configured");

        Ok(ProxyAuth {
            url: Some(url),
            authenticator: Some(authenticator),
        })
    }
}

fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    if url.password().is_some() {
        let _ = url.set_password(Some("***"));
    }
    url.to_string()
}

/// Resolved proxy settings.
#[derive(Clone, Default)]
pub struct ProxyAuth {
    url: Option<Url>,
    authenticator: Option<Arc<dyn ProxyAuthenticator>>,
}

impl fmt::Debug for ProxyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyAuth")
            .field("url", &self.url.as_ref().map(redacted))
            .field("auth_type", &self.auth_type())
            .finish()
    }
}

impl ProxyAuth {
    /// Direct connections; environment proxy variables still apply.
    pub fn none() -> Self {
        Self::default()
    }

    /// The mechanism in effect.
    pub fn auth_type(&self) -> ProxyAuthType {
        self.authenticator
            .as_ref()
            .map(|a| a.auth_type())
            .unwrap_or(ProxyAuthType::None)
    }

    /// The proxy URL, credentials included for basic authentication.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    fn proxy_host(&self) -> Option<String> {
        self.url
            .as_ref()
            .and_then(|url| url.host_str())
            .map(str::to_string)
    }

    /// Build the `reqwest::Proxy` for the current credentials.
    pub fn reqwest_proxy(&self) -> FetchResult<Option<reqwest::Proxy>> {
        let Some(url) = self.url.as_ref() else {
            return Ok(None);
        };

        let mut proxy = reqwest::Proxy::all(url.as_str())
            .map_err(|e| FetchError::Config(format!("invalid proxy url {}: {}", redacted(url), e)))?;

        if let (Some(authenticator), Some(host)) = (self.authenticator.as_ref(), self.proxy_host()) {
            if let Some(value) = authenticator.authorization(&host)? {
                let header = HeaderValue::from_str(&value).map_err(|e| {
                    FetchError::ProxyAuth(format!("invalid Proxy-Authorization value: {}", e))
                })?;
                proxy = proxy.custom_http_auth(header);
            }
        }

        Ok(Some(proxy))
    }

    /// Forget cached proxy credentials after a 407.
    pub fn invalidate(&self) -> bool {
        match (self.authenticator.as_ref(), self.proxy_host()) {
            (Some(authenticator), Some(host)) => authenticator.invalidate(&host),
            _ => false,
        }
    }
}
