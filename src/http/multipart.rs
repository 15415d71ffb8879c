//! `multipart/form-data` body parser (C9).
//!
//! spec.md §4.7 packs each field as a bit-field descriptor written in place
//! over the body buffer's own header bytes, threaded into a linked list by
//! offset arithmetic. Rust's slice type already gives borrowed, zero-copy
//! views without needing a hand-rolled pointer chain to get there, so this
//! keeps the no-copy property (every [`FormField`] borrows directly from
//! the caller's body buffer) while representing the field list as an owned
//! `Vec` instead of an in-place linked list — see DESIGN.md.

use super::request::Body;

/// One parsed field. `data`, `name`, `filename`, and `charset` are all
/// slices into the original body buffer — no bytes are copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormField<'a> {
    pub is_file: bool,
    pub name: &'a [u8],
    pub filename: Option<&'a [u8]>,
    pub charset: Option<&'a [u8]>,
    pub data: &'a [u8],
}

/// `{ field_count, first_field, last_field }` of spec.md §3, realized as an
/// owned field list rather than the in-place linked list (see module docs).
#[derive(Debug, Default)]
pub struct MultiForm<'a> {
    fields: Vec<FormField<'a>>,
}

impl<'a> MultiForm<'a> {
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[FormField<'a>] {
        &self.fields
    }
}

/// `parse_form_data(body) -> MultiForm` — spec.md §4.7. Any protocol
/// deviation from the expected four-stage field grammar yields an empty
/// form rather than a partial one (spec.md step 5: "any protocol deviation
/// → return empty form").
pub fn parse_form_data<'a>(body: &Body<'a>) -> MultiForm<'a> {
    let boundary = match extract_boundary(body.content_type) {
        Some(b) => b,
        None => return MultiForm::default(),
    };
    let mut delim = Vec::with_capacity(boundary.len() + 2);
    delim.extend_from_slice(b"--");
    delim.extend_from_slice(boundary);

    let data = body.data;
    let mut pos = match find(data, &delim, 0) {
        Some(p) => p + delim.len(),
        None => return MultiForm::default(),
    };
    pos = skip_crlf(data, pos);

    let mut fields = Vec::new();
    loop {
        if data[pos..].starts_with(b"--") {
            // Closing boundary with no further fields.
            break;
        }

        let (line, next) = match take_line(data, pos) {
            Some(v) => v,
            None => return MultiForm::default(),
        };
        let (name, filename) = match parse_content_disposition(line) {
            Some(v) => v,
            None => return MultiForm::default(),
        };
        pos = next;

        let (line, next) = match take_line(data, pos) {
            Some(v) => v,
            None => return MultiForm::default(),
        };
        let charset;
        if line.is_empty() {
            charset = None;
            pos = next;
        } else {
            charset = parse_content_type_charset(line);
            pos = next;
            let (blank, next) = match take_line(data, pos) {
                Some(v) => v,
                None => return MultiForm::default(),
            };
            if !blank.is_empty() {
                return MultiForm::default();
            }
            pos = next;
        }

        let boundary_at = match find(data, &delim, pos) {
            Some(p) => p,
            None => return MultiForm::default(),
        };
        let mut data_end = boundary_at;
        if data_end >= pos + 2 && &data[data_end - 2..data_end] == b"\r\n" {
            data_end -= 2;
        }

        fields.push(FormField {
            is_file: filename.is_some(),
            name,
            filename,
            charset,
            data: &data[pos..data_end],
        });

        pos = boundary_at + delim.len();
        if data[pos..].starts_with(b"--") {
            break;
        }
        pos = skip_crlf(data, pos);
    }

    MultiForm { fields }
}

pub fn get_form_field_by_name<'a, 'b>(form: &'b MultiForm<'a>, name: &[u8]) -> Option<&'b FormField<'a>> {
    form.fields.iter().find(|f| f.name == name)
}

pub fn get_form_field_by_idx<'a, 'b>(form: &'b MultiForm<'a>, idx: usize) -> Option<&'b FormField<'a>> {
    form.fields.get(idx)
}

fn extract_boundary(content_type: &[u8]) -> Option<&[u8]> {
    let key = b"boundary=";
    let start = find(content_type, key, 0)? + key.len();
    let rest = &content_type[start..];
    let end = rest.iter().position(|&b| b == b';').unwrap_or(rest.len());
    let token = trim(&rest[..end]);
    let token = token.strip_prefix(b"\"").unwrap_or(token);
    let token = token.strip_suffix(b"\"").unwrap_or(token);
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

fn parse_content_disposition(line: &[u8]) -> Option<(&[u8], Option<&[u8]>)> {
    if !line.starts_with(b"Content-Disposition:") {
        return None;
    }
    let name = extract_quoted(line, b"name=\"")?;
    let filename = extract_quoted(line, b"filename=\"");
    Some((name, filename))
}

fn parse_content_type_charset(line: &[u8]) -> Option<&[u8]> {
    if !line.starts_with(b"Content-Type:") {
        return None;
    }
    extract_quoted_or_bare(line, b"charset=")
}

fn extract_quoted<'a>(line: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    let start = find(line, key, 0)? + key.len();
    let rest = &line[start..];
    let end = rest.iter().position(|&b| b == b'"')?;
    Some(&rest[..end])
}

fn extract_quoted_or_bare<'a>(line: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    let start = find(line, key, 0)? + key.len();
    let rest = &line[start..];
    if rest.first() == Some(&b'"') {
        let rest = &rest[1..];
        let end = rest.iter().position(|&b| b == b'"')?;
        Some(&rest[..end])
    } else {
        let end = rest
            .iter()
            .position(|&b| b == b';' || b == b'\r')
            .unwrap_or(rest.len());
        Some(trim(&rest[..end]))
    }
}

fn take_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let end = find(buf, b"\r\n", start)?;
    Some((&buf[start..end], end + 2))
}

fn skip_crlf(buf: &[u8], pos: usize) -> usize {
    if buf[pos..].starts_with(b"\r\n") {
        pos + 2
    } else {
        pos
    }
}

fn trim(buf: &[u8]) -> &[u8] {
    let start = buf.iter().position(|&b| b != b' ').unwrap_or(buf.len());
    let end = buf.iter().rposition(|&b| b != b' ').map(|i| i + 1).unwrap_or(start);
    &buf[start..end]
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_and_file_fields() {
        let content_type = b"multipart/form-data; boundary=boundary42";
        let body = b"--boundary42\r\n\
Content-Disposition: form-data; name=\"a\"\r\n\
\r\n\
hi\r\n\
--boundary42\r\n\
Content-Disposition: form-data; name=\"f\"; filename=\"t.txt\"\r\n\
Content-Type: text/plain\r\n\
\r\n\
ABC\r\n\
--boundary42--\r\n";

        let form = parse_form_data(&Body {
            content_type,
            data: body,
        });
        assert_eq!(form.field_count(), 2);

        let a = get_form_field_by_name(&form, b"a").unwrap();
        assert!(!a.is_file);
        assert_eq!(a.data, b"hi");

        let f = get_form_field_by_name(&form, b"f").unwrap();
        assert!(f.is_file);
        assert_eq!(f.filename, Some(&b"t.txt"[..]));
        assert_eq!(f.data, b"ABC");
    }

    #[test]
    fn empty_form_on_missing_boundary() {
        let form = parse_form_data(&Body {
            content_type: b"multipart/form-data",
            data: b"whatever",
        });
        assert_eq!(form.field_count(), 0);
    }
}
