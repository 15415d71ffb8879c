//! Incremental HTTP/1 request-line/header parser (C8).
//!
//! Grounded on the `ts_io` buffer-ownership model in `crate::io`: the
//! request never copies — header key/value lengths are written back into
//! the caller's buffer as length-prefix records (a 1-byte key length
//! immediately before the key, a little-endian 2-byte value length
//! immediately before the value), so the previous line's trailing `\n` and
//! the `: ` between a key and its value are exactly the bytes reused to
//! store those prefixes. Iterating headers after a successful parse walks
//! these records by arithmetic advance; it does not rescan the bytes.

use std::fmt;

/// Upper bound on header count a single request may carry — a `u8`
/// packing choice (spec.md §4.6), retained as a hard ceiling.
pub const MAX_NUM_HEADERS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Verb {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Verb {
    fn from_bytes(b: &[u8]) -> Option<Verb> {
        match b {
            b"GET" => Some(Verb::Get),
            b"HEAD" => Some(Verb::Head),
            b"POST" => Some(Verb::Post),
            b"PUT" => Some(Verb::Put),
            b"DELETE" => Some(Verb::Delete),
            b"CONNECT" => Some(Verb::Connect),
            b"OPTIONS" => Some(Verb::Options),
            b"TRACE" => Some(Verb::Trace),
            b"PATCH" => Some(Verb::Patch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Version {
    Http09,
    Http10,
    Http11,
    Http20,
}

impl Version {
    fn from_bytes(b: &[u8]) -> Option<Version> {
        match b {
            b"HTTP/1.0" => Some(Version::Http10),
            b"HTTP/1.1" => Some(Version::Http11),
            b"HTTP/2.0" => Some(Version::Http20),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HttpParse {
    Ok,
    HeaderIncomplete,
    HeaderInvalid,
    HeaderMalicious,
    TooManyHeaders,
}

/// A parsed (or partially parsed) request.
///
/// Reused across calls to [`parse_http_header`] for incremental arrival:
/// once `first_header_offset != 0`, a later call skips the request-line
/// parse and resumes the header loop at `header_size` (spec.md §4.6).
pub struct Request {
    base: *mut u8,
    capacity: usize,
    pub(crate) header_size: usize,
    pub(crate) num_headers: usize,
    pub verb: Option<Verb>,
    pub version: Option<Version>,
    uri_offset: usize,
    path_size: u16,
    query_size: u16,
    first_header_offset: usize,
}

// SAFETY: `Request` is driven by a single caller thread across its
// incremental-parse lifetime, mirroring `TsIo`'s single-owner contract.
unsafe impl Send for Request {}

impl Default for Request {
    fn default() -> Request {
        Request {
            base: std::ptr::null_mut(),
            capacity: 0,
            header_size: 0,
            num_headers: 0,
            verb: None,
            version: None,
            uri_offset: 0,
            path_size: 0,
            query_size: 0,
            first_header_offset: 0,
        }
    }
}

impl Request {
    pub fn new() -> Request {
        Request::default()
    }

    pub fn num_headers(&self) -> usize {
        self.num_headers
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// The decoded, already-validated request path (no query string).
    pub fn path(&self) -> &[u8] {
        // SAFETY: `uri_offset`/`path_size` were written by a successful
        // `parse_http_header` call against this exact buffer.
        unsafe { std::slice::from_raw_parts(self.base.add(self.uri_offset), self.path_size as usize) }
    }

    pub fn query(&self) -> &[u8] {
        if self.query_size == 0 {
            return &[];
        }
        let query_start = self.uri_offset + self.path_size as usize + 1;
        unsafe {
            std::slice::from_raw_parts(self.base.add(query_start), self.query_size as usize)
        }
    }

    fn buffer(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.capacity) }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("verb", &self.verb)
            .field("version", &self.version)
            .field("num_headers", &self.num_headers)
            .field("header_size", &self.header_size)
            .finish()
    }
}

/// `parse_http_header(bytes, &mut request) -> HttpParse` — spec.md §4.6.
///
/// `buf` must be the same backing storage across incremental calls (more
/// bytes may be appended at the end, but previously-written length-prefix
/// records must not move).
pub fn parse_http_header(buf: &mut [u8], request: &mut Request) -> HttpParse {
    request.base = buf.as_mut_ptr();
    request.capacity = buf.len();

    if request.first_header_offset == 0 {
        match parse_first_line(buf) {
            Ok(line) => {
                request.verb = Some(line.verb);
                request.version = Some(line.version);

                let uri = &mut buf[line.uri_start..line.uri_start + line.uri_len];
                let decoded_len = percent_decode_in_place(uri);

                let decoded = &buf[line.uri_start..line.uri_start + decoded_len];
                let (path_len, query_len) = split_path_query(decoded);
                let query_start = if query_len > 0 { path_len + 1 } else { path_len };
                let path = &buf[line.uri_start..line.uri_start + path_len];
                let query = &buf[line.uri_start + query_start..line.uri_start + query_start + query_len];
                if is_malicious(path, query) {
                    return HttpParse::HeaderMalicious;
                }
                if path_len > u16::MAX as usize || query_len > u16::MAX as usize {
                    return HttpParse::HeaderInvalid;
                }

                request.uri_offset = line.uri_start;
                request.path_size = path_len as u16;
                request.query_size = query_len as u16;
                request.header_size = line.consumed;
                // Sentinel marking "request line already parsed"; always
                // nonzero since a request line is never empty.
                request.first_header_offset = line.consumed.max(1);
            }
            Err(LineError::Incomplete) => return HttpParse::HeaderIncomplete,
            Err(LineError::Invalid) => return HttpParse::HeaderInvalid,
        }
    }

    // Reconstructed from the raw pointer rather than through `&mut
    // request`, so the loop body is free to read/write `request`'s other
    // fields in the same breath (mirrors `TsIo::buffer_slice_mut`'s
    // raw-pointer escape from the borrow checker for the same reason).
    let buf: &mut [u8] = unsafe { std::slice::from_raw_parts_mut(request.base, request.capacity) };

    loop {
        let header_size = request.header_size;
        if header_size + 2 > buf.len() {
            return HttpParse::HeaderIncomplete;
        }
        if &buf[header_size..header_size + 2] == b"\r\n" {
            request.header_size += 2;
            return HttpParse::Ok;
        }

        match parse_one_header(buf, header_size) {
            Some(rec) => {
                if request.num_headers >= MAX_NUM_HEADERS {
                    return HttpParse::TooManyHeaders;
                }
                // The byte immediately before the key is the previous
                // record's trailing '\n' (or, for the first header, the
                // request line's); overwrite it with key_len.
                buf[header_size - 1] = rec.key_len as u8;
                // The ": " between key and value becomes the little-endian
                // value-length prefix.
                buf[rec.colon_idx] = (rec.val_len & 0xFF) as u8;
                buf[rec.colon_idx + 1] = ((rec.val_len >> 8) & 0xFF) as u8;

                request.num_headers += 1;
                request.header_size = rec.next_header_start;
            }
            None => return HttpParse::HeaderIncomplete,
        }
    }
}

struct FirstLine {
    verb: Verb,
    uri_start: usize,
    uri_len: usize,
    version: Version,
    consumed: usize,
}

enum LineError {
    Incomplete,
    Invalid,
}

fn parse_first_line(buf: &[u8]) -> Result<FirstLine, LineError> {
    let crlf = match find(buf, b"\r\n", 0) {
        Some(i) => i,
        None => return Err(LineError::Incomplete),
    };
    let line = &buf[..crlf];

    let sp1 = match line.iter().position(|&b| b == b' ') {
        Some(i) => i,
        None => return Err(LineError::Invalid),
    };
    let verb = Verb::from_bytes(&line[..sp1]).ok_or(LineError::Invalid)?;

    let rest = &line[sp1 + 1..];
    match rest.iter().position(|&b| b == b' ') {
        Some(sp2) => {
            let uri_len = sp2;
            let version_bytes = &rest[sp2 + 1..];
            let version = Version::from_bytes(version_bytes).ok_or(LineError::Invalid)?;
            Ok(FirstLine {
                verb,
                uri_start: sp1 + 1,
                uri_len,
                version,
                consumed: crlf + 2,
            })
        }
        None => Ok(FirstLine {
            verb,
            uri_start: sp1 + 1,
            uri_len: rest.len(),
            version: Version::Http09,
            consumed: crlf + 2,
        }),
    }
}

struct HeaderRecord {
    key_len: usize,
    colon_idx: usize,
    val_len: usize,
    next_header_start: usize,
}

/// Parses one `Key: Value\r\n` line starting at `start`, without mutating
/// the buffer (the caller writes the length prefixes back afterward).
fn parse_one_header(buf: &[u8], start: usize) -> Option<HeaderRecord> {
    let colon_idx = find(buf, b": ", start)?;
    let key_len = colon_idx - start;
    if key_len == 0 || key_len >= 0xFF {
        return None;
    }
    let val_start = colon_idx + 2;
    let crlf = find(buf, b"\r\n", val_start)?;
    let val_len = (crlf + 2) - val_start;
    if val_len > u16::MAX as usize {
        return None;
    }
    Some(HeaderRecord {
        key_len,
        colon_idx,
        val_len,
        next_header_start: crlf + 2,
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// Percent-decodes `buf` in place (`+` -> space, `%HH` -> byte `HH`,
/// case-insensitive hex), returning the decoded length. The decoded form is
/// never longer than the input, so a write cursor trailing the read cursor
/// never overtakes it.
fn percent_decode_in_place(buf: &mut [u8]) -> usize {
    let mut read = 0;
    let mut write = 0;
    while read < buf.len() {
        let b = buf[read];
        if b == b'+' {
            buf[write] = b' ';
            read += 1;
        } else if b == b'%' && read + 2 < buf.len() {
            match (hex_val(buf[read + 1]), hex_val(buf[read + 2])) {
                (Some(hi), Some(lo)) => {
                    buf[write] = (hi << 4) | lo;
                    read += 3;
                }
                _ => {
                    buf[write] = b;
                    read += 1;
                }
            }
        } else {
            buf[write] = b;
            read += 1;
        }
        write += 1;
    }
    write
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn split_path_query(uri: &[u8]) -> (usize, usize) {
    match uri.iter().position(|&b| b == b'?') {
        Some(q) => (q, uri.len() - q - 1),
        None => (uri.len(), 0),
    }
}

/// The malicious-URI gate — spec.md §4.6: path traversal (directory depth
/// goes negative) or a trivially XSS-bearing query (`<`, `>`, `"`).
fn is_malicious(path: &[u8], query: &[u8]) -> bool {
    let mut depth: i64 = 0;
    for segment in path.split(|&b| b == b'/') {
        match segment {
            b"" | b"." => {}
            b".." => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            _ => depth += 1,
        }
    }
    query.iter().any(|&b| b == b'<' || b == b'>' || b == b'"')
}

/// `get_header_by_key` — case-insensitive per spec.md §9's Open Question
/// resolution (the source's `EqualStrings` match was case-sensitive, which
/// the spec calls out as a bug HTTP semantics do not allow). Returns the
/// value with the trailing CRLF stripped (SPEC_FULL.md §3.2).
pub fn get_header_by_key<'a>(request: &'a Request, key: &[u8]) -> Option<&'a [u8]> {
    for i in 0..request.num_headers {
        let (k, v) = header_at(request, i)?;
        if k.eq_ignore_ascii_case(key) {
            return Some(strip_crlf(v));
        }
    }
    None
}

pub fn get_header_by_idx(request: &Request, idx: usize) -> Option<(&[u8], &[u8])> {
    let (k, v) = header_at(request, idx)?;
    Some((k, strip_crlf(v)))
}

fn header_at(request: &Request, idx: usize) -> Option<(&[u8], &[u8])> {
    if idx >= request.num_headers {
        return None;
    }
    let buf = request.buffer();
    let mut key_start = request.first_header_offset;
    for _ in 0..idx {
        let key_len = buf[key_start - 1] as usize;
        let key_end = key_start + key_len;
        let val_len = u16::from_le_bytes([buf[key_end], buf[key_end + 1]]) as usize;
        let val_start = key_end + 2;
        key_start = val_start + val_len;
    }
    let key_len = buf[key_start - 1] as usize;
    let key_end = key_start + key_len;
    let val_len = u16::from_le_bytes([buf[key_end], buf[key_end + 1]]) as usize;
    let val_start = key_end + 2;
    Some((&buf[key_start..key_end], &buf[val_start..val_start + val_len]))
}

fn strip_crlf(value: &[u8]) -> &[u8] {
    value
        .strip_suffix(b"\r\n".as_slice())
        .or_else(|| value.strip_suffix(b"\n".as_slice()))
        .unwrap_or(value)
}

/// A `Content-Length`/`Content-Type`-anchored view of the request body,
/// returned by [`get_body_info`].
pub struct Body<'a> {
    pub content_type: &'a [u8],
    pub data: &'a [u8],
}

/// `get_body_info(&request) -> Body` — spec.md §4.7. Only returns a
/// non-empty body when both `Content-Length` (numeric) and `Content-Type`
/// are present; otherwise the caller has nothing to anchor a body view on.
pub fn get_body_info<'a>(request: &'a Request, buf: &'a [u8]) -> Option<Body<'a>> {
    let content_length = get_header_by_key(request, b"Content-Length")?;
    let len: usize = std::str::from_utf8(content_length).ok()?.trim().parse().ok()?;
    let content_type = get_header_by_key(request, b"Content-Type")?;
    let body_start = request.header_size;
    if body_start + len > buf.len() {
        return None;
    }
    Some(Body {
        content_type,
        data: &buf[body_start..body_start + len],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> (HttpParse, Request) {
        let mut buf = input.to_vec();
        let mut req = Request::new();
        let result = parse_http_header(&mut buf, &mut req);
        std::mem::forget(buf); // keep backing storage alive for the request's raw pointer
        (result, req)
    }

    #[test]
    fn parses_simple_request() {
        let (result, req) = parse(b"GET /index.html?q=1 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(result, HttpParse::Ok);
        assert_eq!(req.verb, Some(Verb::Get));
        assert_eq!(req.version, Some(Version::Http11));
        assert_eq!(req.path(), b"/index.html");
        assert_eq!(req.query(), b"q=1");
        assert_eq!(req.num_headers(), 1);
        assert_eq!(get_header_by_key(&req, b"host"), Some(&b"x"[..]));
    }

    #[test]
    fn incremental_arrival() {
        let mut buf = b"GET /ind".to_vec();
        let mut req = Request::new();
        assert_eq!(parse_http_header(&mut buf, &mut req), HttpParse::HeaderIncomplete);

        buf.extend_from_slice(b"ex.html?q=1 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(parse_http_header(&mut buf, &mut req), HttpParse::Ok);
        assert_eq!(req.verb, Some(Verb::Get));
        assert_eq!(req.path(), b"/index.html");
        assert_eq!(req.query(), b"q=1");
        assert_eq!(req.version, Some(Version::Http11));
        assert_eq!(req.num_headers(), 1);
        std::mem::forget(buf);
    }

    #[test]
    fn rejects_path_traversal() {
        let (result, _) = parse(b"GET /../etc/passwd HTTP/1.1\r\n\r\n");
        assert_eq!(result, HttpParse::HeaderMalicious);
    }

    #[test]
    fn rejects_nested_traversal() {
        let (result, _) = parse(b"GET /a/../../b HTTP/1.1\r\n\r\n");
        assert_eq!(result, HttpParse::HeaderMalicious);
    }

    #[test]
    fn accepts_dotted_but_safe_paths() {
        let (result, req) = parse(b"GET /a/./b HTTP/1.1\r\n\r\n");
        assert_eq!(result, HttpParse::Ok);
        assert_eq!(req.path(), b"/a/./b");
    }

    #[test]
    fn rejects_xss_in_query() {
        let (result, _) = parse(b"GET /p?q=<script> HTTP/1.1\r\n\r\n");
        assert_eq!(result, HttpParse::HeaderMalicious);
    }

    #[test]
    fn percent_decoded_traversal_is_rejected() {
        let (result, _) = parse(b"GET /%2e%2e/x HTTP/1.1\r\n\r\n");
        assert_eq!(result, HttpParse::HeaderMalicious);
    }

    #[test]
    fn too_many_headers() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..256 {
            raw.extend_from_slice(format!("H{i}: v\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let mut req = Request::new();
        let result = parse_http_header(&mut raw, &mut req);
        assert_eq!(result, HttpParse::TooManyHeaders);
    }
}
