//! Network utilities

use socket2::SockRef;
use tokio::net::TcpStream;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Pre-encode the `Host` header value for an origin endpoint.
///
/// `host:port`, except when the port is the scheme default (80 for http,
/// 443 for https), in which case the host alone.
pub fn encode_host_header(host: &str, port: u16, is_https: bool) -> String {
    let default_port = if is_https { 443 } else { 80 };
    if port == default_port {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}
