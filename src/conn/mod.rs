//! Connection transport and HTTP/1.1 framing
//!
//! `HttpConnection` owns a byte stream (plain TCP, TLS, or a user-supplied
//! transport), writes requests and parses response heads on it, and answers
//! the non-destructive poll-read probe the pool uses to detect server-side
//! close or stray data on idle connections.

pub mod request;
pub mod response;

pub use request::Request;
pub use response::{Body, Response};

use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// Upper bound on a chunk-size or trailer line
const MAX_LINE_LEN: usize = 16 * 1024;

/// Trait for client transport streams
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AsyncStream for T {}

/// Client transport stream
pub enum ConnStream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<ConnStream>>),
    Custom(Box<dyn AsyncStream>),
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ConnStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            ConnStream::Custom(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ConnStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            ConnStream::Custom(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ConnStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            ConnStream::Custom(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ConnStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            ConnStream::Custom(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Stream that replays buffered bytes before reading from the inner stream.
///
/// Used when a proxy sends tunnel payload in the same segment as the
/// CONNECT response head.
pub struct PrefixedStream {
    prefix: Bytes,
    inner: ConnStream,
}

impl PrefixedStream {
    pub fn new(prefix: Bytes, inner: ConnStream) -> Self {
        PrefixedStream { prefix, inner }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Response body delimitation, advanced in place as the body is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Empty,
    Length(u64),
    Chunked(ChunkPhase),
    Close,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkPhase {
    Size,
    Data(u64),
    DataCrlf,
    Trailers,
}

/// Parsed response head plus the framing of the body that follows it
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub framing: BodyFraming,
}

/// A live HTTP/1.1 client connection
///
/// Exclusively owned by either the pool's idle stack or one in-flight
/// requester. `can_retry` holds while no response bytes have been observed
/// for the current exchange; `reusable` reflects keep-alive negotiation
/// after the response head is parsed.
pub struct HttpConnection {
    stream: ConnStream,
    rbuf: BytesMut,
    created_at: Instant,
    can_retry: bool,
    reusable: bool,
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("can_retry", &self.can_retry)
            .field("reusable", &self.reusable)
            .finish()
    }
}

impl HttpConnection {
    pub fn new(stream: ConnStream) -> Self {
        HttpConnection {
            stream,
            rbuf: BytesMut::with_capacity(8 * 1024),
            created_at: Instant::now(),
            can_retry: true,
            reusable: true,
        }
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether the connection has outlived `lifetime` since creation.
    /// A zero lifetime expires immediately; `None` disables the check.
    pub(crate) fn lifetime_expired(&self, lifetime: Option<Duration>) -> bool {
        match lifetime {
            Some(limit) => self.created_at.elapsed() >= limit,
            None => false,
        }
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Non-destructive readiness probe.
    ///
    /// Clean means the peer has neither closed the connection nor sent
    /// unsolicited bytes. Polls with a no-op waker so nothing blocks; a
    /// ready read (EOF, data, or error) all make the connection unusable
    /// for a new request.
    pub(crate) fn poll_is_clean(&mut self) -> bool {
        if !self.rbuf.is_empty() {
            return false;
        }
        let waker = futures_util::task::noop_waker_ref();
        let mut cx = Context::from_waker(waker);
        let mut probe = [0u8; 1];
        let mut buf = ReadBuf::new(&mut probe);
        match Pin::new(&mut self.stream).poll_read(&mut cx, &mut buf) {
            Poll::Pending => true,
            Poll::Ready(_) => false,
        }
    }

    /// Surrender the transport, replaying any bytes buffered past the last
    /// parsed response head. Used when a CONNECT response promotes the
    /// connection into a raw tunnel.
    pub(crate) fn into_stream(mut self) -> ConnStream {
        if self.rbuf.is_empty() {
            self.stream
        } else {
            let prefix = self.rbuf.split().freeze();
            ConnStream::Custom(Box::new(PrefixedStream::new(prefix, self.stream)))
        }
    }

    /// Write a complete request and parse the response head.
    ///
    /// `absolute_form` selects the absolute-URI request target used for
    /// plain requests sent to a proxy.
    pub(crate) async fn send_request(
        &mut self,
        req: &Request,
        host_header: &str,
        absolute_form: bool,
    ) -> Result<ResponseHead> {
        self.can_retry = true;
        let request_close = header_token(req.headers(), &CONNECTION, "close");
        let head = encode_request(req, host_header, absolute_form);

        self.write_raw(&head).await?;
        if !req.body().is_empty() {
            let body = req.body().clone();
            self.write_raw(&body).await?;
        }

        let mut head = self.read_response_head(req.method()).await?;
        if request_close {
            self.reusable = false;
        }
        // A zero-length body has nothing to stream; the connection can go
        // straight back to the pool.
        if head.framing == BodyFraming::Length(0) {
            head.framing = BodyFraming::Empty;
        }
        Ok(head)
    }

    pub(crate) async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let res = async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        }
        .await;
        res.map_err(|e| Error::transport(e, self.can_retry))
    }

    /// Read and parse a response head, leaving body bytes buffered.
    pub(crate) async fn read_response_head(&mut self, method: &Method) -> Result<ResponseHead> {
        loop {
            if !self.rbuf.is_empty() {
                if let Some(head) = self.try_parse_head(method)? {
                    return Ok(head);
                }
            }
            let n = self
                .stream
                .read_buf(&mut self.rbuf)
                .await
                .map_err(|e| Error::transport(e, self.can_retry))?;
            if n == 0 {
                if self.rbuf.is_empty() && self.can_retry {
                    // Keep-alive race: the server closed the connection
                    // before seeing the request.
                    return Err(Error::transport(
                        io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"),
                        true,
                    ));
                }
                return Err(Error::protocol("connection closed during response head"));
            }
            self.can_retry = false;
        }
    }

    fn try_parse_head(&mut self, method: &Method) -> Result<Option<ResponseHead>> {
        let mut header_storage = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Response::new(&mut header_storage);

        let (len, status, version, headers) = match parsed.parse(&self.rbuf) {
            Ok(httparse::Status::Complete(len)) => {
                let code = parsed.code.ok_or_else(|| Error::protocol("missing status"))?;
                let status = StatusCode::from_u16(code)
                    .map_err(|_| Error::protocol(format!("invalid status code: {}", code)))?;
                let version = match parsed.version {
                    Some(0) => Version::HTTP_10,
                    _ => Version::HTTP_11,
                };
                let mut headers = HeaderMap::with_capacity(parsed.headers.len());
                for h in parsed.headers.iter() {
                    let name = HeaderName::from_bytes(h.name.as_bytes())
                        .map_err(|_| Error::protocol(format!("invalid header name: {}", h.name)))?;
                    let value = HeaderValue::from_bytes(h.value)
                        .map_err(|_| Error::protocol("invalid header value"))?;
                    headers.append(name, value);
                }
                (len, status, version, headers)
            }
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(Error::protocol(format!("invalid response head: {}", e))),
        };

        self.rbuf.advance(len);
        self.can_retry = false;
        let framing = body_framing(method, status, &headers)?;
        self.reusable = connection_keep_alive(version, &headers) && framing != BodyFraming::Close;
        Ok(Some(ResponseHead {
            status,
            version,
            headers,
            framing,
        }))
    }

    async fn read_more(&mut self) -> Result<usize> {
        self.stream
            .read_buf(&mut self.rbuf)
            .await
            .map_err(|e| Error::transport(e, false))
    }

    async fn read_line(&mut self) -> Result<Bytes> {
        loop {
            if let Some(pos) = self.rbuf.windows(2).position(|w| w == b"\r\n") {
                let line = self.rbuf.split_to(pos + 2).freeze();
                return Ok(line.slice(..pos));
            }
            if self.rbuf.len() > MAX_LINE_LEN {
                return Err(Error::protocol("chunk line too long"));
            }
            if self.read_more().await? == 0 {
                return Err(Error::protocol("connection closed mid response body"));
            }
        }
    }

    /// Read the next piece of a response body; `None` once the body ends.
    /// `framing` is advanced in place.
    pub(crate) async fn read_body_piece(
        &mut self,
        framing: &mut BodyFraming,
    ) -> Result<Option<Bytes>> {
        loop {
            match *framing {
                BodyFraming::Empty | BodyFraming::Done => {
                    *framing = BodyFraming::Done;
                    return Ok(None);
                }
                BodyFraming::Length(remaining) => {
                    if remaining == 0 {
                        *framing = BodyFraming::Done;
                        return Ok(None);
                    }
                    if self.rbuf.is_empty() && self.read_more().await? == 0 {
                        return Err(Error::protocol("connection closed mid response body"));
                    }
                    let take = (self.rbuf.len() as u64).min(remaining) as usize;
                    let piece = self.rbuf.split_to(take).freeze();
                    let left = remaining - take as u64;
                    *framing = if left == 0 {
                        BodyFraming::Done
                    } else {
                        BodyFraming::Length(left)
                    };
                    return Ok(Some(piece));
                }
                BodyFraming::Close => {
                    if self.rbuf.is_empty() && self.read_more().await? == 0 {
                        *framing = BodyFraming::Done;
                        return Ok(None);
                    }
                    return Ok(Some(self.rbuf.split().freeze()));
                }
                BodyFraming::Chunked(phase) => match phase {
                    ChunkPhase::Size => {
                        let line = self.read_line().await?;
                        let size = parse_chunk_size(&line)?;
                        *framing = if size == 0 {
                            BodyFraming::Chunked(ChunkPhase::Trailers)
                        } else {
                            BodyFraming::Chunked(ChunkPhase::Data(size))
                        };
                    }
                    ChunkPhase::Data(remaining) => {
                        if self.rbuf.is_empty() && self.read_more().await? == 0 {
                            return Err(Error::protocol("connection closed mid chunk"));
                        }
                        let take = (self.rbuf.len() as u64).min(remaining) as usize;
                        let piece = self.rbuf.split_to(take).freeze();
                        let left = remaining - take as u64;
                        *framing = BodyFraming::Chunked(if left == 0 {
                            ChunkPhase::DataCrlf
                        } else {
                            ChunkPhase::Data(left)
                        });
                        return Ok(Some(piece));
                    }
                    ChunkPhase::DataCrlf => {
                        let line = self.read_line().await?;
                        if !line.is_empty() {
                            return Err(Error::protocol("missing CRLF after chunk data"));
                        }
                        *framing = BodyFraming::Chunked(ChunkPhase::Size);
                    }
                    ChunkPhase::Trailers => {
                        let line = self.read_line().await?;
                        if line.is_empty() {
                            *framing = BodyFraming::Done;
                            return Ok(None);
                        }
                    }
                },
            }
        }
    }
}

/// Serialize the request head.
pub(crate) fn encode_request(req: &Request, host_header: &str, absolute_form: bool) -> Vec<u8> {
    let target = if absolute_form {
        req.uri().to_string()
    } else {
        req.uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    };

    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(req.method().as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    if !req.headers().contains_key(HOST) {
        buf.extend_from_slice(b"Host: ");
        buf.extend_from_slice(host_header.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    for (name, value) in req.headers() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    let needs_length = !req.body().is_empty()
        || matches!(req.method().as_str(), "POST" | "PUT" | "PATCH");
    if needs_length
        && !req.headers().contains_key(CONTENT_LENGTH)
        && !req.headers().contains_key(TRANSFER_ENCODING)
    {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", req.body().len()).as_bytes());
    }

    buf.extend_from_slice(b"\r\n");
    buf
}

fn body_framing(method: &Method, status: StatusCode, headers: &HeaderMap) -> Result<BodyFraming> {
    if *method == Method::CONNECT && status.is_success() {
        return Ok(BodyFraming::Empty);
    }
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::Empty);
    }
    if header_token(headers, &TRANSFER_ENCODING, "chunked") {
        return Ok(BodyFraming::Chunked(ChunkPhase::Size));
    }
    if let Some(value) = headers.get(CONTENT_LENGTH) {
        let len = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::protocol("invalid Content-Length"))?;
        return Ok(BodyFraming::Length(len));
    }
    Ok(BodyFraming::Close)
}

fn connection_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    if header_token(headers, &CONNECTION, "close") {
        return false;
    }
    match version {
        Version::HTTP_11 => true,
        Version::HTTP_10 => header_token(headers, &CONNECTION, "keep-alive"),
        _ => false,
    }
}

fn header_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|s| {
                s.split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    })
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| Error::protocol("invalid chunk size"))?;
    let size_part = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size_part, 16).map_err(|_| Error::protocol("invalid chunk size"))
}
