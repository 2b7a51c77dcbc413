//! SPNEGO (Kerberos) proxy authentication.
//!
//! Tokens are generated for the service principal `HTTP/<proxy-host>` and
//! cached per host until the proxy rejects one with a 407.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;

use super::{ProxyAuthType, ProxyAuthenticator, ProxyConfig};
use crate::error::{FetchError, FetchResult};

const KRB5_CONFIG_CANDIDATES: &[&str] = &[
    "/etc/krb5.conf",
    "/usr/local/etc/krb5.conf",
    "/opt/homebrew/etc/krb5.conf",
];

/// Locate the Kerberos configuration file.
///
/// `KRB5_CONFIG` wins when it names an existing file; otherwise the first
/// existing well-known location is used.
pub fn krb5_config_path() -> Option<PathBuf> {
    let from_env = std::env::var_os("KRB5_CONFIG").map(PathBuf::from);
    from_env
        .into_iter()
        .chain(KRB5_CONFIG_CANDIDATES.iter().map(PathBuf::from))
        .find(|path| path.is_file())
}

/// Produces raw GSS-API tokens for a service principal.
pub trait NegotiateTokenProvider: Send + Sync {
    fn token(&self, service_principal: &str) -> FetchResult<Vec<u8>>;
}

/// Negotiate authenticator with a per-host token cache.
pub struct SpnegoAuthenticator {
    provider: Box<dyn NegotiateTokenProvider>,
    cache: Mutex<HashMap<String, String>>,
}

impl SpnegoAuthenticator {
    pub fn new(provider: Box<dyn NegotiateTokenProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Set up Kerberos from the proxy settings and obtain a first token.
    ///
    /// Fails when credentials or the Kerberos configuration are missing, or
    /// when no ticket can be obtained for the proxy.
    pub fn from_config(config: &ProxyConfig) -> FetchResult<Self> {
        if config.username.is_empty() {
            return Err(FetchError::ProxyAuth(
                "username is required for SPNEGO authentication".to_string(),
            ));
        }
        if config.domain.is_empty() {
            return Err(FetchError::ProxyAuth(
                "domain is required for SPNEGO authentication".to_string(),
            ));
        }

        let krb5_config = krb5_config_path().ok_or_else(|| {
            FetchError::ProxyAuth("no Kerberos configuration (krb5.conf) found".to_string())
        })?;
        tracing::debug!(path = %krb5_config.display(), "using Kerberos configuration");

        let principal = format!("{}@{}", config.username, config.domain.to_ascii_uppercase());
        let authenticator = Self::new(kerberos_provider(&krb5_config, principal)?);

        let host = reqwest::Url::parse(&config.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .ok_or_else(|| FetchError::ProxyAuth(format!("proxy url {:?} has no host", config.url)))?;
        authenticator.authorization(&host)?;

        Ok(authenticator)
    }

    fn cached(&self, host: &str) -> Option<String> {
        self.cache.lock().get(host).cloned()
    }
}

#[cfg(feature = "spnego")]
fn kerberos_provider(krb5_config: &Path, principal: String) -> FetchResult<Box<dyn NegotiateTokenProvider>> {
    if std::env::var_os("KRB5_CONFIG").map(PathBuf::from).as_deref() != Some(krb5_config) {
        std::env::set_var("KRB5_CONFIG", krb5_config);
    }
    Ok(Box::new(KerberosTokenProvider::new(Some(principal))))
}

#[cfg(not(feature = "spnego"))]
fn kerberos_provider(_krb5_config: &Path, _principal: String) -> FetchResult<Box<dyn NegotiateTokenProvider>> {
    Err(FetchError::ProxyAuth(
        "SPNEGO support is not compiled in (enable the `spnego` feature)".to_string(),
    ))
}

impl ProxyAuthenticator for SpnegoAuthenticator {
    fn auth_type(&self) -> ProxyAuthType {
        ProxyAuthType::Spnego
    }

    fn authorization(&self, proxy_host: &str) -> FetchResult<Option<String>> {
        if let Some(token) = self.cached(proxy_host) {
            return Ok(Some(format!("Negotiate {}", token)));
        }

        let spn = format!("HTTP/{}", proxy_host);
        let token = STANDARD.encode(self.provider.token(&spn)?);
        tracing::debug!(spn = %spn, token_len = token.len(), "generated SPNEGO token");

        self.cache.lock().insert(proxy_host.to_string(), token.clone());
        Ok(Some(format!("Negotiate {}", token)))
    }

    fn invalidate(&self, proxy_host: &str) -> bool {
        self.cache.lock().remove(proxy_host);
        true
    }
}

/// Token provider backed by the system GSS-API (credential cache).
#[cfg(feature = "spnego")]
pub struct KerberosTokenProvider {
    principal: Option<String>,
}

#[cfg(feature = "spnego")]
impl KerberosTokenProvider {
    pub fn new(principal: Option<String>) -> Self {
        Self { principal }
    }
}

#[cfg(feature = "spnego")]
impl NegotiateTokenProvider for KerberosTokenProvider {
    fn token(&self, service_principal: &str) -> FetchResult<Vec<u8>> {
        let (_pending, token) = cross_krb5::ClientCtx::new(
            cross_krb5::InitiateFlags::empty(),
            self.principal.as_deref(),
            service_principal,
            None,
        )
        .map_err(|e| {
            FetchError::ProxyAuth(format!(
                "failed to generate SPNEGO token for SPN {}: {}. \
                 Ensure the SPN is registered in the KDC and the proxy hostname is correct",
                service_principal, e
            ))
        })?;
        Ok(token.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingProvider {
        calls: Arc<AtomicUsize>,
    }

    impl NegotiateTokenProvider for CountingProvider {
        fn token(&self, service_principal: &str) -> FetchResult<Vec<u8>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}#{}", service_principal, n).into_bytes())
        }
    }

    fn authenticator() -> (SpnegoAuthenticator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = CountingProvider {
            calls: Arc::clone(&calls),
        };
        (SpnegoAuthenticator::new(Box::new(provider)), calls)
    }

    #[test]
    fn test_token_is_cached_per_host() {
        let (auth, calls) = authenticator();

        let first = auth.authorization("proxy.corp").unwrap().unwrap();
        let second = auth.authorization("proxy.corp").unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, format!("Negotiate {}", STANDARD.encode("HTTP/proxy.corp#0")));

        auth.authorization("other.corp").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalidate_forces_new_token() {
        let (auth, calls) = authenticator();

        let first = auth.authorization("proxy.corp").unwrap();
        assert!(auth.invalidate("proxy.corp"));
        let second = auth.authorization("proxy.corp").unwrap();

        assert_ne!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let err = SpnegoAuthenticator::from_config(&ProxyConfig::new("http://proxy:3128"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("username"));

        let err = SpnegoAuthenticator::from_config(
            &ProxyConfig::new("http://proxy:3128").with_credentials("alice", "pw"),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("domain"));
    }
}
