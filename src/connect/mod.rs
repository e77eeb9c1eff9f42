//! Connection factory
//!
//! Turns an endpoint key into a ready connection: TCP dial (or the user's
//! connect callback), proxy CONNECT tunneling through the sibling
//! proxy-connect pool, and a TLS handshake when the pool targets an
//! HTTPS origin. A non-200 CONNECT answer is not an error here: the
//! proxy's response is handed back to stand in for the origin's.

use crate::auth;
use crate::common::net::configure_tcp_stream;
use crate::conn::{Body, ConnStream, HttpConnection, Response};
use crate::pool::{Acquired, ConnectionPool, PoolKey, PoolKind, PoolTls};
use crate::{Error, Result};
use bytes::BytesMut;
use http::Method;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Factory result: a ready connection, or the proxy's refusal.
pub(crate) enum ConnectOutcome {
    Conn(HttpConnection),
    Rejected(Response),
}

/// Establish a connection for `pool`, bounded by the configured connect
/// timeout. Expiry surfaces as `ConnectTimeout`, not a generic cancel.
pub(crate) async fn establish(pool: &ConnectionPool) -> Result<ConnectOutcome> {
    match pool.options().connect_timeout {
        Some(limit) => tokio::time::timeout(limit, establish_inner(pool)).await?,
        None => establish_inner(pool).await,
    }
}

async fn establish_inner(pool: &ConnectionPool) -> Result<ConnectOutcome> {
    let key = pool.key();
    let stream = match key.kind {
        PoolKind::Http | PoolKind::Https | PoolKind::ProxyConnect => {
            let (host, port) = origin_endpoint(key)?;
            dial(pool, host, port).await?
        }
        PoolKind::Proxy => {
            let proxy = key
                .proxy
                .as_ref()
                .ok_or_else(|| Error::address("proxy kind without a proxy endpoint"))?;
            dial(pool, &proxy.host, proxy.port).await?
        }
        PoolKind::ProxyTunnel | PoolKind::SslProxyTunnel => match tunnel(pool).await? {
            TunnelOutcome::Stream(stream) => stream,
            TunnelOutcome::Rejected(response) => {
                return Ok(ConnectOutcome::Rejected(response));
            }
        },
    };

    let stream = match pool.tls() {
        Some(tls) => tls_handshake(tls, stream).await?,
        None => stream,
    };
    Ok(ConnectOutcome::Conn(HttpConnection::new(stream)))
}

fn origin_endpoint(key: &PoolKey) -> Result<(&str, u16)> {
    match (key.host.as_deref(), key.port) {
        (Some(host), Some(port)) => Ok((host, port)),
        _ => Err(Error::address(format!("key {} has no origin endpoint", key))),
    }
}

async fn dial(pool: &ConnectionPool, host: &str, port: u16) -> Result<ConnStream> {
    if let Some(callback) = &pool.options().connect_callback {
        trace!("Dialing {}:{} via connect callback", host, port);
        return callback(host, port).await;
    }
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::transport(e, false))?;
    configure_tcp_stream(&stream);
    Ok(ConnStream::Tcp(stream))
}

enum TunnelOutcome {
    Stream(ConnStream),
    Rejected(Response),
}

/// Send a CONNECT through the sibling proxy-connect pool and promote the
/// carrying connection into the tunnel transport.
///
/// Boxed: tunneling acquires from the sibling pool, whose acquisition in
/// turn names this factory, so the future type must be erased to tie the
/// knot.
fn tunnel(pool: &ConnectionPool) -> Pin<Box<dyn Future<Output = Result<TunnelOutcome>> + Send + '_>> {
    Box::pin(tunnel_inner(pool))
}

async fn tunnel_inner(pool: &ConnectionPool) -> Result<TunnelOutcome> {
    let key = pool.key();
    let manager = pool.manager().ok_or(Error::Disposed)?;
    let proxy = key
        .proxy
        .as_ref()
        .ok_or_else(|| Error::address("tunnel kind without a proxy endpoint"))?
        .clone();
    let (host, port) = origin_endpoint(key)?;
    let target = format!("{}:{}", host, port);

    let connect_pool = manager.pool_for(PoolKey::proxy_connect(proxy.clone()));
    // The CONNECT rides the sibling pool's own cap arbitration. The overall
    // connect timeout bounds this wait; abandoning it frees the lease.
    let never = CancellationToken::new();
    let mut lease = match connect_pool.acquire(&never).await? {
        Acquired::Leased { lease, .. } => lease,
        Acquired::TunnelRejected(_) => {
            return Err(Error::protocol("proxy-connect pool cannot tunnel"));
        }
    };

    let auth_header = auth::proxy_credentials(&proxy, pool.options())
        .map(|creds| auth::basic_header(&creds));
    let request = encode_connect_request(&target, auth_header.as_deref());

    trace!("Sending CONNECT {} via {}", target, proxy.uri);
    lease.conn_mut().write_raw(request.as_bytes()).await?;
    let head = lease.conn_mut().read_response_head(&Method::CONNECT).await?;

    if head.status.is_success() {
        debug!("Tunnel established to {} via {}", target, proxy.uri);
        return Ok(TunnelOutcome::Stream(lease.detach_stream()));
    }

    debug!("Tunnel to {} rejected by {}: {}", target, proxy.uri, head.status);
    // Buffer the proxy's body so the response survives the connection.
    let mut framing = head.framing;
    let mut collected = BytesMut::new();
    while let Ok(Some(piece)) = lease.conn_mut().read_body_piece(&mut framing).await {
        collected.extend_from_slice(&piece);
    }
    lease.dispose();
    Ok(TunnelOutcome::Rejected(Response::new(
        head.status,
        head.version,
        head.headers,
        Body::full(collected.freeze()),
    )))
}

fn encode_connect_request(target: &str, proxy_auth: Option<&str>) -> String {
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some(auth) = proxy_auth {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");
    request
}

async fn tls_handshake(tls: &PoolTls, stream: ConnStream) -> Result<ConnStream> {
    let connector = TlsConnector::from(tls.config.clone());
    let server_name = ServerName::try_from(tls.server_name.clone())
        .map_err(|_| Error::tls(format!("invalid TLS server name: {}", tls.server_name)))?;
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))?;
    Ok(ConnStream::Tls(Box::new(tls_stream)))
}

/// Client config trusting the bundled webpki roots
pub(crate) fn default_tls_client_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_format() {
        let request = encode_connect_request("origin.test:443", None);
        assert_eq!(
            request,
            "CONNECT origin.test:443 HTTP/1.1\r\nHost: origin.test:443\r\n\r\n"
        );
    }

    #[test]
    fn test_connect_request_with_proxy_auth() {
        let request = encode_connect_request("origin.test:443", Some("Basic dXNlcjpwYXNz"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }
}
