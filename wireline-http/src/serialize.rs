//! HTTP/1.1 request wire emission.
//!
//! Output is deterministic for a given request: user headers in insertion
//! order, the pinned User-Agent, a Host derived from the resource URL, and
//! Content-Length exactly when the body is non-empty.

use crate::request::Request;

pub(crate) const USER_AGENT: &str = "wireline/0.1";

/// Split a resource URL into (host-with-optional-port, path-with-query).
///
/// Strips an optional `http://` scheme and a literal `www.` prefix, then
/// splits at the first `?` or `/`. The query suffix, if present in the URL
/// itself, stays attached to the path part.
pub(crate) fn split_url(url: &str) -> (&str, &str) {
    let rest = url.strip_prefix("http://").unwrap_or(url);
    let rest = rest.strip_prefix("www.").unwrap_or(rest);
    match rest.find(['?', '/']) {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    }
}

/// Serialize a request into its on-wire form.
pub(crate) fn write_request(request: &Request) -> Vec<u8> {
    let (host, path) = split_url(&request.resource);

    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(request.method.as_str().as_bytes());
    buf.push(b' ');
    if !path.starts_with('/') {
        buf.push(b'/');
    }
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(request.query.to_query_string().as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    if !request.cookies.is_empty() {
        buf.extend_from_slice(b"Cookie: ");
        for (i, cookie) in request.cookies.iter().enumerate() {
            if i > 0 {
                buf.extend_from_slice(b"; ");
            }
            buf.extend_from_slice(cookie.name.as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(cookie.value.as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
    }

    for (name, value) in request.headers.iter() {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"User-Agent: ");
    buf.extend_from_slice(USER_AGENT.as_bytes());
    buf.extend_from_slice(b"\r\n");

    buf.extend_from_slice(b"Host: ");
    buf.extend_from_slice(host.as_bytes());
    buf.extend_from_slice(b"\r\n");

    if !request.body.is_empty() {
        buf.extend_from_slice(b"Content-Length: ");
        buf.extend_from_slice(request.body.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"\r\n");

    if !request.body.is_empty() {
        buf.extend_from_slice(&request.body);
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Cookie, Method, Query};

    #[test]
    fn split_plain_host() {
        assert_eq!(split_url("http://example.org/"), ("example.org", "/"));
        assert_eq!(split_url("example.org"), ("example.org", ""));
        assert_eq!(
            split_url("http://example.org/a/b?x=1"),
            ("example.org", "/a/b?x=1")
        );
    }

    #[test]
    fn split_strips_www_prefix() {
        assert_eq!(split_url("http://www.example.org/"), ("example.org", "/"));
        assert_eq!(split_url("www.example.org"), ("example.org", ""));
    }

    #[test]
    fn split_keeps_port_in_host() {
        assert_eq!(
            split_url("http://127.0.0.1:8080/path"),
            ("127.0.0.1:8080", "/path")
        );
    }

    #[test]
    fn split_query_without_path() {
        assert_eq!(split_url("http://h?x=1"), ("h", "?x=1"));
    }

    #[test]
    fn post_with_body_and_header() {
        let mut request = Request::new(Method::Post, "http://h/x".to_string());
        request.headers.add("X-Y", "1");
        request.body = bytes::Bytes::from_static(b"abc");

        let wire = write_request(&request);
        let expected = b"POST /x HTTP/1.1\r\n\
                         X-Y: 1\r\n\
                         User-Agent: wireline/0.1\r\n\
                         Host: h\r\n\
                         Content-Length: 3\r\n\
                         \r\n\
                         abc";
        assert_eq!(wire, expected);
    }

    #[test]
    fn get_without_body_omits_content_length() {
        let request = Request::new(Method::Get, "http://example.org".to_string());
        let wire = String::from_utf8(write_request(&request)).unwrap();
        assert!(wire.starts_with("GET / HTTP/1.1\r\n"));
        assert!(!wire.contains("Content-Length"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn cookies_on_one_line_before_headers() {
        let mut request = Request::new(Method::Get, "http://h/".to_string());
        request.cookies.push(Cookie::new("a", "1"));
        request.cookies.push(Cookie::new("b", "2"));
        request.headers.add("X", "y");

        let wire = String::from_utf8(write_request(&request)).unwrap();
        let cookie_pos = wire.find("Cookie: a=1; b=2\r\n").unwrap();
        let header_pos = wire.find("X: y\r\n").unwrap();
        assert!(cookie_pos < header_pos);
    }

    #[test]
    fn query_params_appended_to_path() {
        let mut request = Request::new(Method::Get, "http://h/search".to_string());
        request.query = Query::new().add("q", "rust").add("page", "2");
        let wire = String::from_utf8(write_request(&request)).unwrap();
        assert!(wire.starts_with("GET /search?q=rust&page=2 HTTP/1.1\r\n"));
    }

    #[test]
    fn slash_prepended_when_path_missing() {
        let request = Request::new(Method::Get, "http://h?x=1".to_string());
        let wire = String::from_utf8(write_request(&request)).unwrap();
        assert!(wire.starts_with("GET /?x=1 HTTP/1.1\r\n"));
    }
}
