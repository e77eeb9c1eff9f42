//! Outgoing request representation
//!
//! Requests are owned, cheaply-cloneable values: the body is a refcounted
//! `Bytes`, so auth layers and the retry loop can clone-and-decorate
//! without mutating the caller's request.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};

#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(uri: Uri) -> Self {
        Request::new(Method::GET, uri)
    }

    pub fn post(uri: Uri, body: Bytes) -> Self {
        Request::new(Method::POST, uri).with_body(body)
    }

    /// Builder-style header append.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Whether any header has been set, without materializing anything.
    pub fn has_headers(&self) -> bool {
        !self.headers.is_empty()
    }
}
