//! Basic proxy authentication: credentials travel in the proxy URL.

use reqwest::Url;

use super::{ProxyAuthType, ProxyAuthenticator, ProxyConfig};
use crate::error::{FetchError, FetchResult};

#[derive(Debug, Clone)]
pub struct BasicAuthenticator {
    username: String,
    password: String,
}

impl BasicAuthenticator {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }
}

impl ProxyAuthenticator for BasicAuthenticator {
    fn auth_type(&self) -> ProxyAuthType {
        ProxyAuthType::Basic
    }

    fn prepare_url(&self, url: &mut Url) -> FetchResult<()> {
        if self.username.is_empty() && self.password.is_empty() {
            return Ok(());
        }

        let scheme = url.scheme().to_string();
        let cannot_embed = || FetchError::ProxyAuth(format!("cannot embed credentials in proxy url {}", scheme));
        url.set_username(&self.username).map_err(|_| cannot_embed())?;
        url.set_password(Some(&self.password)).map_err(|_| cannot_embed())?;
        Ok(())
    }
}
