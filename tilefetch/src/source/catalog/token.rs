//! Catalog credentials.
//!
//! Short tokens are legacy API tokens sent as-is. Longer ones are refresh
//! tokens, exchanged once for an access token on first use.

use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, FetchResult};
use crate::http::{ClientKind, HttpClients};

/// Tokens longer than this are refresh tokens.
const LEGACY_TOKEN_MAX_LEN: usize = 20;

/// Supplies the `Authorization` header value for catalog calls.
///
/// Acquiring or refreshing the credential is the implementor's business;
/// the catalog client only asks for the current value.
pub trait TokenSource: Send + Sync {
    fn authorization(&self) -> FetchResult<String>;
}

/// A fixed credential.
#[derive(Clone, PartialEq, Eq)]
pub struct StaticToken {
    header: String,
}

impl StaticToken {
    /// An OAuth access token, sent as `Bearer <token>`.
    pub fn bearer(token: &str) -> Self {
        Self {
            header: format!("Bearer {}", token),
        }
    }

    /// A legacy API token, sent as `Token <token>`.
    pub fn legacy(token: &str) -> Self {
        Self {
            header: format!("Token {}", token),
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = self.header.split(' ').next().unwrap_or_default();
        write!(f, "StaticToken({} ***)", scheme)
    }
}

impl TokenSource for StaticToken {
    fn authorization(&self) -> FetchResult<String> {
        Ok(self.header.clone())
    }
}

#[derive(Serialize)]
struct AccessTokenRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

/// A refresh token exchanged for a bearer access token.
pub struct RefreshToken {
    host: String,
    refresh_token: String,
    clients: Arc<HttpClients>,
    access_token: Mutex<Option<String>>,
}

impl std::fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshToken").field("host", &self.host).finish()
    }
}

impl RefreshToken {
    pub fn new(host: impl Into<String>, refresh_token: impl Into<String>, clients: Arc<HttpClients>) -> Self {
        Self {
            host: host.into(),
            refresh_token: refresh_token.into(),
            clients,
            access_token: Mutex::new(None),
        }
    }

    fn exchange(&self) -> FetchResult<String> {
        let url = format!("{}/api/v2/authentication/access_tokens", self.host.trim_end_matches('/'));
        let body = AccessTokenRequest {
            refresh_token: &self.refresh_token,
        };

        let response = self
            .clients
            .send(ClientKind::Api, |client| {
                client.post(&url).header(ACCEPT, "application/json").json(&body)
            })
            .map_err(|e| FetchError::transport(&url, e))?;
        if !response.status().is_success() {
            return Err(FetchError::BadStatus {
                method: "POST".to_string(),
                url,
                status: response.status().as_u16(),
            });
        }

        let token: AccessTokenResponse = response
            .json()
            .map_err(|e| FetchError::transport(&url, format!("could not decode access token: {}", e)))?;
        tracing::debug!(host = %self.host, "exchanged refresh token for access token");
        Ok(token.access_token)
    }
}

impl TokenSource for RefreshToken {
    fn authorization(&self) -> FetchResult<String> {
        let mut cached = self.access_token.lock();
        if let Some(token) = cached.as_ref() {
            return Ok(format!("Bearer {}", token));
        }
        let token = self.exchange()?;
        let header = format!("Bearer {}", token);
        *cached = Some(token);
        Ok(header)
    }
}

/// The token source for a user-supplied catalog token.
pub fn token_source(host: &str, token: &str, clients: Arc<HttpClients>) -> Arc<dyn TokenSource> {
    if token.len() > LEGACY_TOKEN_MAX_LEN {
        Arc::new(RefreshToken::new(host, token, clients))
    } else {
        Arc::new(StaticToken::legacy(token))
    }
}
