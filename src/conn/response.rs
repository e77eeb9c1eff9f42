//! Response representation and streamed body
//!
//! The body streams straight off the pooled connection. Once the final
//! byte is consumed the connection goes back to its pool; dropping a body
//! early disposes the connection instead, since unread payload leaves the
//! stream in an unknown framing position.

use super::{BodyFraming, HttpConnection};
use crate::pool::ConnectionPool;
use crate::Result;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use std::fmt;
use std::sync::Arc;

/// Response to a dispatched request
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Body,
}

impl Response {
    pub(crate) fn new(status: StatusCode, version: Version, headers: HeaderMap, body: Body) -> Self {
        Response {
            status,
            version,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    /// Drain the body into one buffer.
    pub async fn bytes(self) -> Result<Bytes> {
        self.body.bytes().await
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Response body
pub struct Body {
    inner: BodyInner,
}

enum BodyInner {
    Full(Bytes),
    Streaming(StreamingBody),
}

struct StreamingBody {
    conn: Option<HttpConnection>,
    pool: Arc<ConnectionPool>,
    framing: BodyFraming,
}

impl Body {
    pub(crate) fn empty() -> Self {
        Body {
            inner: BodyInner::Full(Bytes::new()),
        }
    }

    pub(crate) fn full(bytes: Bytes) -> Self {
        Body {
            inner: BodyInner::Full(bytes),
        }
    }

    pub(crate) fn streaming(
        conn: HttpConnection,
        pool: Arc<ConnectionPool>,
        framing: BodyFraming,
    ) -> Self {
        Body {
            inner: BodyInner::Streaming(StreamingBody {
                conn: Some(conn),
                pool,
                framing,
            }),
        }
    }

    /// Next piece of the body, `None` once it ends. The connection returns
    /// to its pool when the end is reached.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        let streaming = match &mut self.inner {
            BodyInner::Full(bytes) => {
                if bytes.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(bytes)));
            }
            BodyInner::Streaming(streaming) => streaming,
        };
        let conn = match streaming.conn.as_mut() {
            Some(conn) => conn,
            None => return Ok(None),
        };
        match conn.read_body_piece(&mut streaming.framing).await {
            Ok(Some(piece)) => {
                if streaming.framing == BodyFraming::Done {
                    streaming.finish();
                }
                Ok(Some(piece))
            }
            Ok(None) => {
                streaming.finish();
                Ok(None)
            }
            Err(e) => {
                streaming.abort();
                Err(e)
            }
        }
    }

    /// Drain the whole body into one buffer.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(piece) = self.chunk().await? {
            collected.extend_from_slice(&piece);
        }
        Ok(collected.freeze())
    }

    /// Consume and discard the remainder of the body so the connection can
    /// be recycled.
    pub(crate) async fn drain(mut self) -> Result<()> {
        while self.chunk().await?.is_some() {}
        Ok(())
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            BodyInner::Full(bytes) => f.debug_tuple("Body::Full").field(&bytes.len()).finish(),
            BodyInner::Streaming(_) => f.debug_tuple("Body::Streaming").finish(),
        }
    }
}

impl StreamingBody {
    /// Body fully consumed: give the connection back to the pool.
    fn finish(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }

    /// Framing failure: the stream position is unknown, dispose.
    fn abort(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.dispose_checked_out(conn);
        }
    }
}

impl Drop for StreamingBody {
    fn drop(&mut self) {
        // Unread payload leaves the stream mid-body.
        if let Some(conn) = self.conn.take() {
            self.pool.dispose_checked_out(conn);
        }
    }
}
