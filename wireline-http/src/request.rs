//! Request model and the fluent builder.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::client::Client;
use crate::ResponseFuture;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered query parameters, emitted verbatim in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Query {
    params: Vec<(String, String)>,
}

impl Query {
    pub fn new() -> Query {
        Query::default()
    }

    pub fn add(mut self, name: impl Into<String>, value: impl Into<String>) -> Query {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// `""` when empty, otherwise `?a=b&c=d`.
    pub fn to_query_string(&self) -> String {
        if self.params.is_empty() {
            return String::new();
        }
        let mut out = String::from("?");
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(name);
            out.push('=');
            out.push_str(value);
        }
        out
    }
}

/// A request cookie.
#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Cookie {
        Cookie {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered header collection. Insertion order is preserved on the wire.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Remove every occurrence of `name` (case-insensitive).
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// First value for `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A logical request, snapshotted at submission.
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) resource: String,
    pub(crate) query: Query,
    pub(crate) headers: Headers,
    pub(crate) cookies: Vec<Cookie>,
    pub(crate) body: Bytes,
}

impl Request {
    pub(crate) fn new(method: Method, resource: String) -> Request {
        Request {
            method,
            resource,
            query: Query::default(),
            headers: Headers::default(),
            cookies: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Fluent request builder, created by the verb helpers on
/// [`Client`](crate::Client).
///
/// ```rust,ignore
/// let resp = client.get("http://example.org/api")
///     .header("authorization", "Bearer tok")
///     .timeout(Duration::from_secs(2))
///     .send()
///     .wait()?;
/// ```
pub struct RequestBuilder<'a> {
    client: &'a Client,
    request: Request,
    timeout: Duration,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, resource: &str) -> Self {
        RequestBuilder {
            client,
            request: Request::new(method, resource.to_string()),
            timeout: Duration::ZERO,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.request.method = method;
        self
    }

    pub fn resource(mut self, resource: &str) -> Self {
        self.request.resource = resource.to_string();
        self
    }

    /// Set query parameters, appended after the resource path.
    pub fn params(mut self, query: Query) -> Self {
        self.request.query = query;
        self
    }

    /// Add a header. Insertion order is preserved on the wire.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.request.headers.add(name, value);
        self
    }

    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.request.cookies.push(cookie);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.request.body = body.into();
        self
    }

    /// Reject the request with a timeout error if no response completes
    /// within `timeout`. Zero (the default) disables the timer.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Submit the request.
    pub fn send(self) -> ResponseFuture {
        self.client.do_request(self.request, self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_string_preserves_insertion_order() {
        let q = Query::new().add("b", "2").add("a", "1");
        assert_eq!(q.to_query_string(), "?b=2&a=1");
        assert_eq!(Query::new().to_query_string(), "");
    }

    #[test]
    fn headers_remove_is_case_insensitive() {
        let mut h = Headers::default();
        h.add("User-Agent", "x");
        h.add("X-Test", "1");
        h.add("user-agent", "y");
        h.remove("USER-AGENT");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("x-test"), Some("1"));
    }
}
