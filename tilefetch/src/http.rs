//! Shared blocking HTTP clients.
//!
//! Every outbound request goes through [`HttpClients`], which is also the
//! only place the proxy configuration is applied. Four clients are kept,
//! differing in timeout and redirect policy:
//!
//! - `Api`: JSON calls, bounded total timeout
//! - `Head`: the download size lookup, bounded by the HEAD timeout
//! - `Transfer`: range bodies; no total deadline, but every body read fails
//!   once the connection has been silent for the read timeout. The blocking
//!   client applies its timeout to each read separately, which is exactly an
//!   inactivity timeout.
//! - `NoRedirect`: calls whose `Location` header is the answer

use std::time::Duration;

use parking_lot::RwLock;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::redirect::Policy;
use reqwest::StatusCode;

use crate::download::{DEFAULT_HEAD_TIMEOUT, DEFAULT_INACTIVITY_TIMEOUT};
use crate::error::{FetchError, FetchResult};
use crate::proxy::ProxyAuth;

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("tilefetch/", env!("CARGO_PKG_VERSION"));

/// Timeout for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(300);

/// Connect timeout for body transfers.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Which client a request should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Api,
    Head,
    Transfer,
    NoRedirect,
}

#[derive(Clone)]
struct ClientSet {
    api: Client,
    head: Client,
    transfer: Client,
    no_redirect: Client,
}

impl ClientSet {
    fn build(timeouts: Timeouts, proxy: &ProxyAuth) -> FetchResult<Self> {
        let proxy = proxy.reqwest_proxy()?;
        let builder = || {
            let builder = Client::builder().user_agent(USER_AGENT);
            match proxy.clone() {
                Some(proxy) => builder.proxy(proxy),
                None => builder,
            }
        };
        let finish = |builder: reqwest::blocking::ClientBuilder| {
            builder
                .build()
                .map_err(|e| FetchError::Config(format!("could not create HTTP client: {}", e)))
        };

        Ok(Self {
            api: finish(builder().timeout(API_TIMEOUT))?,
            head: finish(builder().timeout(timeouts.head))?,
            transfer: finish(builder().timeout(timeouts.read).connect_timeout(CONNECT_TIMEOUT))?,
            no_redirect: finish(builder().timeout(API_TIMEOUT).redirect(Policy::none()))?,
        })
    }

    fn get(&self, kind: ClientKind) -> &Client {
        match kind {
            ClientKind::Api => &self.api,
            ClientKind::Head => &self.head,
            ClientKind::Transfer => &self.transfer,
            ClientKind::NoRedirect => &self.no_redirect,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    head: Duration,
    read: Duration,
}

/// The HTTP clients of one process, with proxy settings applied.
pub struct HttpClients {
    timeouts: Timeouts,
    proxy: ProxyAuth,
    clients: RwLock<ClientSet>,
}

impl std::fmt::Debug for HttpClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClients")
            .field("head_timeout", &self.timeouts.head)
            .field("read_timeout", &self.timeouts.read)
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl HttpClients {
    /// Build clients routed through `proxy`.
    ///
    /// `read_timeout` bounds each body read of the `Transfer` client and
    /// should match the download inactivity timeout.
    pub fn new(head_timeout: Duration, read_timeout: Duration, proxy: ProxyAuth) -> FetchResult<Self> {
        let timeouts = Timeouts {
            head: head_timeout,
            read: read_timeout,
        };
        let clients = ClientSet::build(timeouts, &proxy)?;
        Ok(Self {
            timeouts,
            proxy,
            clients: RwLock::new(clients),
        })
    }

    /// Build clients without an explicit proxy.
    pub fn direct() -> FetchResult<Self> {
        Self::new(DEFAULT_HEAD_TIMEOUT, DEFAULT_INACTIVITY_TIMEOUT, ProxyAuth::none())
    }

    /// Wall-clock limit of the `Head` client.
    pub fn head_timeout(&self) -> Duration {
        self.timeouts.head
    }

    /// Longest silence a `Transfer` body read waits through.
    pub fn read_timeout(&self) -> Duration {
        self.timeouts.read
    }

    /// A handle to one of the clients.
    pub fn client(&self, kind: ClientKind) -> Client {
        self.clients.read().get(kind).clone()
    }

    /// Send the request produced by `build`.
    ///
    /// When the proxy answers 407 and its credentials can be refreshed, the
    /// clients are rebuilt and the request is sent once more.
    pub fn send<F>(&self, kind: ClientKind, build: F) -> reqwest::Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = build(&self.client(kind)).send()?;
        if response.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED || !self.proxy.invalidate() {
            return Ok(response);
        }

        tracing::debug!("proxy rejected credentials, refreshing and retrying once");
        match ClientSet::build(self.timeouts, &self.proxy) {
            Ok(rebuilt) => {
                *self.clients.write() = rebuilt;
                build(&self.client(kind)).send()
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not refresh proxy credentials");
                Ok(response)
            }
        }
    }
}
