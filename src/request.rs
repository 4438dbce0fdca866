//! Incoming HTTP request types.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};

use crate::client_ip::HeaderSource;

/// Everything about a request except its body and route parameters.
///
/// Middleware sees the head through [`Context`](crate::middleware::Context);
/// the handler receives the full [`Request`].
#[derive(Clone, Debug)]
pub struct RequestHead {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) remote_addr: Option<SocketAddr>,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self { method, uri, headers, remote_addr: None }
    }

    /// Attaches the TCP peer address. With a proxy in front this is the proxy.
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    pub fn path(&self) -> &str { self.uri.path() }

    /// Path plus query string, exactly as received (`/search?q=tsu`).
    pub fn path_and_query(&self) -> &str {
        self.uri.path_and_query().map_or_else(|| self.uri.path(), |pq| pq.as_str())
    }
}

impl From<http::request::Parts> for RequestHead {
    fn from(parts: http::request::Parts) -> Self {
        Self::new(parts.method, parts.uri, parts.headers)
    }
}

impl HeaderSource for RequestHead {
    fn header_lines(&self, name: &str) -> Vec<&[u8]> { self.headers.header_lines(name) }
    fn has(&self, name: &str) -> bool { self.headers.has(name) }
}

/// An incoming HTTP request with its body fully buffered.
pub struct Request {
    pub(crate) head: RequestHead,
    pub(crate) body: Bytes,
    pub(crate) params: HashMap<String, String>,
}

impl Request {
    pub(crate) fn new(head: RequestHead, body: Bytes, params: HashMap<String, String>) -> Self {
        Self { head, body, params }
    }

    pub fn head(&self) -> &RequestHead { &self.head }
    pub fn method(&self) -> &Method { &self.head.method }
    pub fn path(&self) -> &str { self.head.path() }
    pub fn headers(&self) -> &HeaderMap { &self.head.headers }
    pub fn body(&self) -> &[u8] { &self.body }

    /// Case-insensitive header lookup; repeated lines are joined with `", "`.
    pub fn header(&self, name: &str) -> Option<Cow<'_, str>> {
        self.head.header(name)
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Best-guess client address from proxy headers. See [`client_ip`](crate::client_ip()).
    pub fn client_ip(&self) -> Option<&str> {
        crate::client_ip::client_ip(&self.head)
    }
}
