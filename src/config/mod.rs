//! Client transport configuration

use crate::conn::ConnStream;
use crate::{Error, Result};
use http::Uri;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Future returned by a user connect callback.
pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<ConnStream>> + Send>>;

/// User hook replacing the default TCP dial. Receives the endpoint to dial.
pub type ConnectCallback = Arc<dyn Fn(&str, u16) -> ConnectFuture + Send + Sync>;

/// Username/password pair for Basic authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Resolver from request URI to proxy URI
pub trait ProxyResolver: Send + Sync {
    /// Proxy URI to use for `target`, or `None` for a direct connection.
    fn proxy_for(&self, target: &Uri) -> Option<Uri>;
}

/// Resolver that routes every request through one proxy
pub struct FixedProxy {
    uri: Uri,
}

impl FixedProxy {
    pub fn new(uri: Uri) -> Self {
        FixedProxy { uri }
    }
}

impl ProxyResolver for FixedProxy {
    fn proxy_for(&self, _target: &Uri) -> Option<Uri> {
        Some(self.uri.clone())
    }
}

/// Transport options
///
/// Durations use `None` for "infinite" (the check is disabled). A zero
/// `pooled_connection_lifetime` means never pool; a zero
/// `pooled_connection_idle_timeout` means dispose on return.
#[derive(Clone)]
pub struct Options {
    /// Per-pool connection cap. `usize::MAX` disables waiter logic.
    pub max_connections_per_server: usize,

    /// Max age of a connection from creation to final reuse.
    pub pooled_connection_lifetime: Option<Duration>,

    /// Max time a connection may sit idle in the pool.
    pub pooled_connection_idle_timeout: Option<Duration>,

    /// Upper bound on dial + handshake. `None` disables.
    pub connect_timeout: Option<Duration>,

    /// Enables the per-pool credential cache for preemptive auth.
    pub pre_authenticate: bool,

    /// TLS configuration cloned per pool; the SNI name is overridden with the
    /// pool's ssl host. `None` uses the built-in webpki-roots store.
    pub ssl: Option<Arc<rustls::ClientConfig>>,

    /// Request-level credentials.
    pub credentials: Option<Credentials>,

    /// Proxy resolver.
    pub proxy: Option<Arc<dyn ProxyResolver>>,

    /// Credentials used when a resolved proxy URI carries none.
    pub default_proxy_credentials: Option<Credentials>,

    /// Optional user hook replacing the default TCP dial.
    pub connect_callback: Option<ConnectCallback>,

    /// Route plain-http requests through a proxy CONNECT tunnel instead of
    /// sending them in absolute form.
    pub tunnel_plain_http: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            max_connections_per_server: usize::MAX,
            pooled_connection_lifetime: None,
            pooled_connection_idle_timeout: Some(Duration::from_secs(90)),
            connect_timeout: Some(Duration::from_secs(10)),
            pre_authenticate: false,
            ssl: None,
            credentials: None,
            proxy: None,
            default_proxy_credentials: None,
            connect_callback: None,
            tunnel_plain_http: false,
        }
    }
}

impl Options {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections_per_server == 0 {
            return Err(Error::config("max_connections_per_server must be nonzero"));
        }
        Ok(())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("max_connections_per_server", &self.max_connections_per_server)
            .field("pooled_connection_lifetime", &self.pooled_connection_lifetime)
            .field(
                "pooled_connection_idle_timeout",
                &self.pooled_connection_idle_timeout,
            )
            .field("connect_timeout", &self.connect_timeout)
            .field("pre_authenticate", &self.pre_authenticate)
            .field("has_ssl", &self.ssl.is_some())
            .field("has_credentials", &self.credentials.is_some())
            .field("has_proxy", &self.proxy.is_some())
            .field("tunnel_plain_http", &self.tunnel_plain_http)
            .finish()
    }
}
