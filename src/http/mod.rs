//! HTTP/1 request parsing, `multipart/form-data` bodies, and response
//! formatting (C8-C10). Independent of the transport: everything here
//! consumes bytes already sitting in a caller-owned buffer, the same
//! "caller owns the memory" posture as [`crate::io::TsIo`]'s `io_buffer`.

mod multipart;
mod request;
mod response;
mod status;

pub use multipart::{get_form_field_by_idx, get_form_field_by_name, parse_form_data, FormField, MultiForm};
pub use request::{
    get_body_info, get_header_by_idx, get_header_by_key, parse_http_header, Body, HttpParse,
    Request, Verb, Version, MAX_NUM_HEADERS,
};
pub use response::{craft_http_response_header, Response};
pub use status::status_phrase;
