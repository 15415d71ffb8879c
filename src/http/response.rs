//! HTTP/1 response header formatting (C10).
//!
//! Grounded on [`super::request`]'s "caller owns the bytes" posture:
//! [`craft_http_response_header`] appends into a caller-provided buffer
//! rather than allocating and returning a `String`.

use std::io::Write as _;

use super::request::Version;
use super::status::status_phrase;

/// A response to format. Every byte slice borrows from the caller; nothing
/// here owns the header or payload data it describes.
pub struct Response<'a> {
    pub status_code: u16,
    pub version: Version,
    pub keep_alive: bool,
    pub cookies: Vec<&'a [u8]>,
    pub payload_size: u64,
    pub payload_type: Option<&'a [u8]>,
}

impl<'a> Response<'a> {
    pub fn new(status_code: u16, version: Version) -> Response<'a> {
        Response {
            status_code,
            version,
            keep_alive: true,
            cookies: Vec::new(),
            payload_size: 0,
            payload_type: None,
        }
    }
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::Http09 => "HTTP/0.9",
        Version::Http10 => "HTTP/1.0",
        Version::Http11 => "HTTP/1.1",
        Version::Http20 => "HTTP/2.0",
    }
}

/// `craft_http_response_header(response, out, server_name)` — spec.md §4.8.
///
/// Writes the status line, `Date` (RFC 7231 IMF-fixdate via the `httpdate`
/// crate — colon-separated, correcting the source's colon-less rendering),
/// `Server`, a permissive CORS header, `Connection`, `Content-Length`, an
/// optional `Content-Type`, any `Set-Cookie` lines, and the terminating
/// blank line. Never fails: a write into a `Vec<u8>` cannot error.
pub fn craft_http_response_header(response: &Response<'_>, out: &mut Vec<u8>, server_name: Option<&str>) {
    let _ = write!(
        out,
        "{} {} {}\r\n",
        version_str(response.version),
        response.status_code,
        status_phrase(response.status_code)
    );

    let _ = write!(out, "Date: {}\r\n", httpdate::fmt_http_date(std::time::SystemTime::now()));

    if let Some(name) = server_name {
        let _ = write!(out, "Server: {name}\r\n");
    }

    out.extend_from_slice(b"Access-Control-Allow-Origin: *\r\n");

    let _ = write!(
        out,
        "Connection: {}\r\n",
        if response.keep_alive { "keep-alive" } else { "close" }
    );

    let _ = write!(out, "Content-Length: {}\r\n", response.payload_size);

    if let Some(content_type) = response.payload_type {
        out.extend_from_slice(b"Content-Type: ");
        out.extend_from_slice(content_type);
        out.extend_from_slice(b"\r\n");
    }

    for cookie in &response.cookies {
        out.extend_from_slice(b"Set-Cookie: ");
        out.extend_from_slice(cookie);
        out.extend_from_slice(b"\r\n");
    }

    // Per spec.md §4.8: the blank line only terminates the header block
    // when there are no cookies; with cookies present, the caller appends
    // it after writing whatever else belongs in the header.
    if response.cookies.is_empty() {
        out.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_minimal_response() {
        let response = Response::new(200, Version::Http11);
        let mut out = Vec::new();
        craft_http_response_header(&response, &mut out, Some("tsio"));
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Server: tsio\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        // RFC 7231 IMF-fixdate is colon-separated, e.g. "12:34:56 GMT".
        let date_line = text.lines().find(|l| l.starts_with("Date: ")).unwrap();
        assert!(date_line.contains(':'));
        assert!(date_line.ends_with("GMT"));
    }

    #[test]
    fn formats_full_response_with_cookies_and_content_type() {
        let mut response = Response::new(404, Version::Http11);
        response.keep_alive = false;
        response.payload_size = 13;
        response.payload_type = Some(b"text/plain");
        response.cookies.push(b"a=1");
        response.cookies.push(b"b=2");

        let mut out = Vec::new();
        craft_http_response_header(&response, &mut out, None);
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(!text.contains("Server:"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Set-Cookie: a=1\r\n"));
        assert!(text.contains("Set-Cookie: b=2\r\n"));
        // No terminating blank line when cookies are present — the caller
        // appends it (spec.md §4.8).
        assert!(text.ends_with("Set-Cookie: b=2\r\n"));
    }
}
