//! Credentials for signed bucket access.
//!
//! `accesskey` uses a fixed key pair. `iam` takes the standard `AWS_*`
//! environment variables when they are set and otherwise asks the instance
//! metadata service for the credentials of the attached role, refreshing
//! them shortly before they expire.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::{FetchError, FetchResult};
use crate::http::{ClientKind, HttpClients};

/// Instance metadata endpoint unless `AWS_EC2_METADATA_SERVICE_ENDPOINT` is set.
pub const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254";

const METADATA_ENDPOINT_VAR: &str = "AWS_EC2_METADATA_SERVICE_ENDPOINT";
const ACCESS_KEY_ID_VAR: &str = "AWS_ACCESS_KEY_ID";
const SECRET_ACCESS_KEY_VAR: &str = "AWS_SECRET_ACCESS_KEY";
const SESSION_TOKEN_VAR: &str = "AWS_SESSION_TOKEN";

const METADATA_TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const METADATA_TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const METADATA_TOKEN_TTL_SECS: &str = "21600";
const ROLE_PATH: &str = "/latest/meta-data/iam/security-credentials/";

/// Role credentials are fetched again this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// How requests to a bucket are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3AuthType {
    /// Unsigned requests.
    Anonymous,
    /// A fixed access key id and secret.
    AccessKey,
    /// Environment or instance role credentials.
    Iam,
}

impl S3AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::AccessKey => "accesskey",
            Self::Iam => "iam",
        }
    }
}

impl fmt::Display for S3AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for S3AuthType {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "anonymous" => Ok(Self::Anonymous),
            "accesskey" => Ok(Self::AccessKey),
            "iam" => Ok(Self::Iam),
            other => Err(FetchError::Config(format!(
                "bucket auth_type must be anonymous, accesskey or iam, got {:?}",
                other
            ))),
        }
    }
}

/// A key pair, with a session token for temporary credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl S3Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and
    /// `AWS_SESSION_TOKEN` as answered by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let credentials = Self::new(non_empty(ACCESS_KEY_ID_VAR)?, non_empty(SECRET_ACCESS_KEY_VAR)?);
        Some(match non_empty(SESSION_TOKEN_VAR) {
            Some(token) => credentials.with_session_token(token),
            None => credentials,
        })
    }

    /// Credentials from the process environment.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Supplies the credentials a request is signed with.
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self) -> FetchResult<S3Credentials>;
}

impl CredentialsProvider for S3Credentials {
    fn credentials(&self) -> FetchResult<S3Credentials> {
        Ok(self.clone())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
    expiration: Option<String>,
}

struct Cached {
    credentials: S3Credentials,
    expires_at: Option<DateTime<Utc>>,
}

impl Cached {
    fn fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at
                .signed_duration_since(now)
                .to_std()
                .is_ok_and(|left| left > REFRESH_MARGIN),
        }
    }
}

/// Credentials of the role attached to the instance.
pub struct InstanceRoleCredentials {
    endpoint: String,
    clients: Arc<HttpClients>,
    cached: Mutex<Option<Cached>>,
}

impl fmt::Debug for InstanceRoleCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRoleCredentials")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl InstanceRoleCredentials {
    /// Query the metadata service at `endpoint`. The clients should not
    /// route through a proxy.
    pub fn new(endpoint: impl Into<String>, clients: Arc<HttpClients>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            clients,
            cached: Mutex::new(None),
        }
    }

    /// Query the endpoint named by the environment, or the default one.
    pub fn from_env(clients: Arc<HttpClients>) -> Self {
        let endpoint = std::env::var(METADATA_ENDPOINT_VAR)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_METADATA_ENDPOINT.to_string());
        Self::new(endpoint, clients)
    }

    fn session_token(&self) -> FetchResult<String> {
        let url = format!("{}/latest/api/token", self.endpoint);
        let response = self
            .clients
            .send(ClientKind::Head, |client| {
                client
                    .put(&url)
                    .header(METADATA_TOKEN_TTL_HEADER, METADATA_TOKEN_TTL_SECS)
            })
            .map_err(|e| FetchError::transport(&url, e))?;
        read_text("PUT", url, response)
    }

    fn metadata(&self, path: &str, token: &str) -> FetchResult<String> {
        let url = format!("{}{}", self.endpoint, path);
        let response = self
            .clients
            .send(ClientKind::Head, |client| client.get(&url).header(METADATA_TOKEN_HEADER, token))
            .map_err(|e| FetchError::transport(&url, e))?;
        read_text("GET", url, response)
    }

    fn fetch(&self) -> FetchResult<Cached> {
        let token = self.session_token()?;
        let roles = self.metadata(ROLE_PATH, token.trim())?;
        let role = roles
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| FetchError::Config("the instance has no IAM role attached".to_string()))?;

        let path = format!("{}{}", ROLE_PATH, role);
        let body = self.metadata(&path, token.trim())?;
        let role_credentials: RoleCredentials = serde_json::from_str(&body).map_err(|e| {
            FetchError::transport(
                &format!("{}{}", self.endpoint, path),
                format!("could not decode role credentials: {}", e),
            )
        })?;

        let expires_at = role_credentials
            .expiration
            .as_deref()
            .map(|stamp| {
                DateTime::parse_from_rfc3339(stamp)
                    .map(|at| at.with_timezone(&Utc))
                    .map_err(|e| FetchError::Config(format!("invalid credential expiration {:?}: {}", stamp, e)))
            })
            .transpose()?;

        let mut credentials = S3Credentials::new(role_credentials.access_key_id, role_credentials.secret_access_key);
        credentials.session_token = role_credentials.token;
        tracing::debug!(role, expires_at = ?expires_at, "fetched instance role credentials");
        Ok(Cached {
            credentials,
            expires_at,
        })
    }
}

impl CredentialsProvider for InstanceRoleCredentials {
    fn credentials(&self) -> FetchResult<S3Credentials> {
        let mut cached = self.cached.lock();
        if let Some(current) = cached.as_ref().filter(|current| current.fresh(Utc::now())) {
            return Ok(current.credentials.clone());
        }
        let fetched = self.fetch()?;
        let credentials = fetched.credentials.clone();
        *cached = Some(fetched);
        Ok(credentials)
    }
}

fn read_text(method: &str, url: String, response: reqwest::blocking::Response) -> FetchResult<String> {
    if !response.status().is_success() {
        return Err(FetchError::BadStatus {
            method: method.to_string(),
            url,
            status: response.status().as_u16(),
        });
    }
    response
        .text()
        .map_err(|e| FetchError::transport(&url, format!("could not read response: {}", e)))
}

/// The credentials for `auth_type`, `None` for anonymous access.
///
/// `metadata_clients` are only used for `iam` when the environment holds no
/// key pair.
pub fn credentials_provider(
    auth_type: S3AuthType,
    access_key_id: Option<&str>,
    secret_access_key: Option<&str>,
    metadata_clients: Arc<HttpClients>,
) -> FetchResult<Option<Arc<dyn CredentialsProvider>>> {
    match auth_type {
        S3AuthType::Anonymous => Ok(None),
        S3AuthType::AccessKey => match (access_key_id, secret_access_key) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
                Ok(Some(Arc::new(S3Credentials::new(id, secret))))
            }
            _ => Err(FetchError::Config(
                "accesskey authentication needs both an access key id and a secret access key".to_string(),
            )),
        },
        S3AuthType::Iam => match S3Credentials::from_env() {
            Some(credentials) => {
                tracing::debug!(access_key_id = %credentials.access_key_id, "using bucket credentials from environment");
                Ok(Some(Arc::new(credentials)))
            }
            None => Ok(Some(Arc::new(InstanceRoleCredentials::from_env(metadata_clients)))),
        },
    }
}
