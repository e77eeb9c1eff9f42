//! End-to-end pool behavior against local mock servers

use sockpool::{Client, Credentials, Error, FixedProxy, Options, Request};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

/// Run with RUST_LOG=sockpool=trace to watch pool decisions.
fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Some(String::from_utf8_lossy(&buf).into_owned());
        }
    }
}

/// Serve keep-alive GETs, counting accepted connections. `delay` runs
/// before each response; `close_after` closes the socket after that many
/// responses.
async fn spawn_server(delay: Duration, close_after: Option<usize>) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = accepts.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut served = 0usize;
                while read_request(&mut stream).await.is_some() {
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    if stream.write_all(OK_RESPONSE).await.is_err() {
                        break;
                    }
                    served += 1;
                    if close_after.is_some_and(|limit| served >= limit) {
                        break;
                    }
                }
            });
        }
    });
    (addr, accepts)
}

/// Proxy that refuses every CONNECT with 407.
async fn spawn_rejecting_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                while read_request(&mut stream).await.is_some() {
                    let response = b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                                     Content-Length: 6\r\n\r\ndenied";
                    if stream.write_all(response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Absolute-form proxy: records request heads and answers 200 directly.
async fn spawn_plain_proxy() -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let recorder = recorder.clone();
            tokio::spawn(async move {
                while let Some(head) = read_request(&mut stream).await {
                    recorder.lock().unwrap().push(head);
                    if stream.write_all(OK_RESPONSE).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, seen)
}

fn uri_for(addr: SocketAddr) -> http::Uri {
    format!("http://127.0.0.1:{}/", addr.port()).parse().unwrap()
}

fn single_connection_options() -> Options {
    Options {
        max_connections_per_server: 1,
        pooled_connection_idle_timeout: None,
        pooled_connection_lifetime: None,
        ..Default::default()
    }
}

#[tokio::test]
async fn sequential_requests_reuse_one_connection() {
    let (addr, accepts) = spawn_server(Duration::ZERO, None).await;
    let client = Client::new(single_connection_options()).unwrap();
    let uri = uri_for(addr);

    for _ in 0..2 {
        let response = client.send(Request::get(uri.clone())).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(&response.bytes().await.unwrap()[..], b"hello");
    }
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn capped_pool_hands_released_connection_to_waiter() {
    trace_init();
    let (addr, accepts) = spawn_server(Duration::from_millis(150), None).await;
    let client = Arc::new(Client::new(single_connection_options()).unwrap());
    let uri = uri_for(addr);

    let first = {
        let client = client.clone();
        let uri = uri.clone();
        tokio::spawn(async move { client.send(Request::get(uri)).await.unwrap().bytes().await })
    };
    sleep(Duration::from_millis(30)).await;
    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.send(Request::get(uri)).await.unwrap().bytes().await })
    };

    assert_eq!(&first.await.unwrap().unwrap()[..], b"hello");
    assert_eq!(&second.await.unwrap().unwrap()[..], b"hello");
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_connection_is_detected_and_redialed() {
    let (addr, accepts) = spawn_server(Duration::ZERO, Some(1)).await;
    let client = Client::new(single_connection_options()).unwrap();
    let uri = uri_for(addr);

    let response = client.send(Request::get(uri.clone())).await.unwrap();
    assert_eq!(&response.bytes().await.unwrap()[..], b"hello");

    // Let the server-side FIN land so the probe sees the close.
    sleep(Duration::from_millis(50)).await;

    let response = client.send(Request::get(uri)).await.unwrap();
    assert_eq!(&response.bytes().await.unwrap()[..], b"hello");
    assert_eq!(accepts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rejected_tunnel_surfaces_proxy_response() {
    trace_init();
    let proxy_addr = spawn_rejecting_proxy().await;
    let proxy_uri: http::Uri = format!("http://127.0.0.1:{}", proxy_addr.port())
        .parse()
        .unwrap();
    let client = Client::new(Options {
        proxy: Some(Arc::new(FixedProxy::new(proxy_uri))),
        ..Default::default()
    })
    .unwrap();

    let response = client
        .send(Request::get("https://origin.test/".parse().unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), 407);
    assert_eq!(&response.bytes().await.unwrap()[..], b"denied");

    for (key, snapshot) in client.manager().snapshots() {
        assert_eq!(snapshot.associated, 0, "pool {} leaked a slot", key);
    }
}

#[tokio::test]
async fn expired_lifetime_forces_a_second_dial() {
    let (addr, accepts) = spawn_server(Duration::ZERO, None).await;
    let client = Client::new(Options {
        max_connections_per_server: 1,
        pooled_connection_lifetime: Some(Duration::from_millis(100)),
        pooled_connection_idle_timeout: None,
        ..Default::default()
    })
    .unwrap();
    let uri = uri_for(addr);

    let response = client.send(Request::get(uri.clone())).await.unwrap();
    response.bytes().await.unwrap();
    sleep(Duration::from_millis(200)).await;
    let response = client.send(Request::get(uri)).await.unwrap();
    response.bytes().await.unwrap();

    assert_eq!(accepts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancelled_waiter_does_not_consume_the_connection() {
    trace_init();
    let (addr, accepts) = spawn_server(Duration::from_millis(150), None).await;
    let client = Arc::new(Client::new(single_connection_options()).unwrap());
    let uri = uri_for(addr);

    let first = {
        let client = client.clone();
        let uri = uri.clone();
        tokio::spawn(async move { client.send(Request::get(uri)).await.unwrap().bytes().await })
    };
    sleep(Duration::from_millis(30)).await;

    let cancel = CancellationToken::new();
    let second = {
        let client = client.clone();
        let uri = uri.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.send_with_cancel(Request::get(uri), &cancel).await })
    };
    sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    let err = second.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    // The released connection pools instead of being wasted on the
    // cancelled waiter, and a later request picks it up directly.
    assert_eq!(&first.await.unwrap().unwrap()[..], b"hello");
    let response = client.send(Request::get(uri)).await.unwrap();
    assert_eq!(&response.bytes().await.unwrap()[..], b"hello");
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn plain_http_through_proxy_uses_absolute_form() {
    let (proxy_addr, seen) = spawn_plain_proxy().await;
    let proxy_uri: http::Uri = format!("http://127.0.0.1:{}", proxy_addr.port())
        .parse()
        .unwrap();
    let client = Client::new(Options {
        proxy: Some(Arc::new(FixedProxy::new(proxy_uri))),
        ..Default::default()
    })
    .unwrap();

    let response = client
        .send(Request::get("http://origin.test/path".parse().unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(&response.bytes().await.unwrap()[..], b"hello");

    let seen = seen.lock().unwrap();
    assert!(seen[0].starts_with("GET http://origin.test/path HTTP/1.1\r\n"));
    assert!(seen[0].contains("Host: origin.test\r\n"));
}

/// Proxy that accepts CONNECT and then answers tunneled requests itself,
/// standing in for the origin.
async fn spawn_tunneling_proxy() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = accepts.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let head = match read_request(&mut stream).await {
                    Some(head) => head,
                    None => return,
                };
                assert!(head.starts_with("CONNECT "));
                if stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                while read_request(&mut stream).await.is_some() {
                    if stream.write_all(OK_RESPONSE).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, accepts)
}

#[tokio::test]
async fn plain_http_tunnels_when_configured() {
    let (proxy_addr, accepts) = spawn_tunneling_proxy().await;
    let proxy_uri: http::Uri = format!("http://127.0.0.1:{}", proxy_addr.port())
        .parse()
        .unwrap();
    let client = Client::new(Options {
        proxy: Some(Arc::new(FixedProxy::new(proxy_uri))),
        tunnel_plain_http: true,
        ..Default::default()
    })
    .unwrap();

    let uri: http::Uri = "http://origin.test/".parse().unwrap();
    for _ in 0..2 {
        let response = client.send(Request::get(uri.clone())).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(&response.bytes().await.unwrap()[..], b"hello");
    }
    // Both requests ride one tunnel: a single proxy connection.
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unauthorized_response_triggers_credential_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = accepts.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                while let Some(head) = read_request(&mut stream).await {
                    // Header names go lowercase on the wire.
                    let response: &[u8] = if head.contains("authorization: Basic ") {
                        OK_RESPONSE
                    } else {
                        b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n"
                    };
                    if stream.write_all(response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let client = Client::new(Options {
        credentials: Some(Credentials::new("user", "pass")),
        ..Default::default()
    })
    .unwrap();
    let response = client
        .send(Request::get(uri_for(addr)))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(&response.bytes().await.unwrap()[..], b"hello");
    // The drained 401 recycles the connection for the authorized retry.
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn proxy_challenge_retries_with_default_credentials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                while let Some(head) = read_request(&mut stream).await {
                    let response: &[u8] = if head.contains("proxy-authorization: Basic ") {
                        OK_RESPONSE
                    } else {
                        b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n"
                    };
                    if stream.write_all(response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let proxy_uri: http::Uri = format!("http://127.0.0.1:{}", addr.port()).parse().unwrap();
    let client = Client::new(Options {
        proxy: Some(Arc::new(FixedProxy::new(proxy_uri))),
        default_proxy_credentials: Some(Credentials::new("proxyuser", "proxypass")),
        ..Default::default()
    })
    .unwrap();

    let response = client
        .send(Request::get("http://origin.test/".parse().unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(&response.bytes().await.unwrap()[..], b"hello");
}

#[tokio::test]
async fn chunked_responses_keep_the_connection_reusable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = accepts.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                while read_request(&mut stream).await.is_some() {
                    let response = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                                     5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
                    if stream.write_all(response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let client = Client::new(single_connection_options()).unwrap();
    let uri = uri_for(addr);
    for _ in 0..2 {
        let response = client.send(Request::get(uri.clone())).await.unwrap();
        assert_eq!(&response.bytes().await.unwrap()[..], b"hello world");
    }
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}
