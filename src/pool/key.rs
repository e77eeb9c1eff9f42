//! Endpoint keys and pool kind classification

use crate::{Error, Result};
use http::Uri;
use std::fmt;

/// How a pool reaches its endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Plain HTTP straight to the origin
    Http,
    /// TLS straight to the origin
    Https,
    /// Plain HTTP in absolute form through a proxy, no tunnel
    Proxy,
    /// HTTP origin through a proxy CONNECT
    ProxyTunnel,
    /// HTTPS origin through a proxy CONNECT
    SslProxyTunnel,
    /// Connections used to send the CONNECT itself
    ProxyConnect,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Http => write!(f, "http"),
            PoolKind::Https => write!(f, "https"),
            PoolKind::Proxy => write!(f, "proxy"),
            PoolKind::ProxyTunnel => write!(f, "proxy-tunnel"),
            PoolKind::SslProxyTunnel => write!(f, "ssl-proxy-tunnel"),
            PoolKind::ProxyConnect => write!(f, "proxy-connect"),
        }
    }
}

/// A proxy endpoint, pre-resolved for dialing
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    /// Canonical proxy URI (identity of the proxy within a key)
    pub uri: String,
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let host = uri
            .host()
            .ok_or_else(|| Error::address(format!("proxy URI has no host: {}", uri)))?
            .to_string();
        let default_port = match uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        };
        let port = uri.port_u16().unwrap_or(default_port);
        Ok(ProxyEndpoint {
            uri: uri.to_string(),
            host,
            port,
        })
    }

    pub fn to_uri(&self) -> Result<Uri> {
        self.uri
            .parse()
            .map_err(|_| Error::address(format!("invalid proxy URI: {}", self.uri)))
    }
}

/// Names exactly one connection pool.
///
/// Field presence by kind is fixed: origin host/port are absent only for
/// the raw `Proxy` kind, `ssl_host` is present only when TLS is layered
/// toward the origin, and `proxy` is present for the four proxied kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub kind: PoolKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// SNI/validation name; overrides the shared TLS options.
    pub ssl_host: Option<String>,
    pub proxy: Option<ProxyEndpoint>,
}

impl PoolKey {
    pub fn http(host: String, port: u16) -> Self {
        PoolKey {
            kind: PoolKind::Http,
            host: Some(host),
            port: Some(port),
            ssl_host: None,
            proxy: None,
        }
    }

    pub fn https(host: String, port: u16) -> Self {
        PoolKey {
            kind: PoolKind::Https,
            ssl_host: Some(host.clone()),
            host: Some(host),
            port: Some(port),
            proxy: None,
        }
    }

    pub fn proxy(proxy: ProxyEndpoint) -> Self {
        PoolKey {
            kind: PoolKind::Proxy,
            host: None,
            port: None,
            ssl_host: None,
            proxy: Some(proxy),
        }
    }

    pub fn proxy_tunnel(host: String, port: u16, proxy: ProxyEndpoint) -> Self {
        PoolKey {
            kind: PoolKind::ProxyTunnel,
            host: Some(host),
            port: Some(port),
            ssl_host: None,
            proxy: Some(proxy),
        }
    }

    pub fn ssl_proxy_tunnel(host: String, port: u16, proxy: ProxyEndpoint) -> Self {
        PoolKey {
            kind: PoolKind::SslProxyTunnel,
            ssl_host: Some(host.clone()),
            host: Some(host),
            port: Some(port),
            proxy: Some(proxy),
        }
    }

    /// Key of the sibling pool that carries the CONNECT requests for
    /// `proxy`. Its origin endpoint is the proxy itself.
    pub fn proxy_connect(proxy: ProxyEndpoint) -> Self {
        PoolKey {
            kind: PoolKind::ProxyConnect,
            host: Some(proxy.host.clone()),
            port: Some(proxy.port),
            ssl_host: None,
            proxy: Some(proxy),
        }
    }

    pub fn is_secure(&self) -> bool {
        self.ssl_host.is_some()
    }

    pub fn uses_proxy(&self) -> bool {
        self.proxy.is_some()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let (Some(host), Some(port)) = (&self.host, self.port) {
            write!(f, "://{}:{}", host, port)?;
        }
        if let Some(proxy) = &self.proxy {
            write!(f, " via {}", proxy.uri)?;
        }
        Ok(())
    }
}

/// Classify a request URI (plus the resolved proxy for it) into the key of
/// the pool that must carry it.
pub fn classify(uri: &Uri, proxy: Option<&Uri>, tunnel_plain_http: bool) -> Result<PoolKey> {
    let is_https = match uri.scheme_str() {
        Some("http") => false,
        Some("https") => true,
        other => {
            return Err(Error::address(format!(
                "unsupported scheme: {}",
                other.unwrap_or("none")
            )))
        }
    };
    let host = uri
        .host()
        .ok_or_else(|| Error::address(format!("request URI has no host: {}", uri)))?
        .to_string();
    let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

    let proxy = match proxy {
        Some(p) => Some(ProxyEndpoint::from_uri(p)?),
        None => None,
    };

    Ok(match (proxy, is_https) {
        (None, false) => PoolKey::http(host, port),
        (None, true) => PoolKey::https(host, port),
        (Some(p), true) => PoolKey::ssl_proxy_tunnel(host, port, p),
        (Some(p), false) => {
            if tunnel_plain_http {
                PoolKey::proxy_tunnel(host, port, p)
            } else {
                PoolKey::proxy(p)
            }
        }
    })
}
