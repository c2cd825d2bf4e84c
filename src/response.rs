use http::{HeaderMap, StatusCode, Version};
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, DATE};
use httpdate;
use std::time::SystemTime;

use {Request, Response};


pub(crate) const CONTINUE: &'static [u8] = b"HTTP/1.1 100 Continue\r\n\r\n";


/// Whether `headers` list `token` under `Connection`
pub(crate) fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers.get_all(CONNECTION).iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}


/// Whether the client wants the connection kept open after `request` is answered
pub(crate) fn wants_keep_alive(request: &Request) -> bool {
    let version = request.version();
    if version == Version::HTTP_09 || version == Version::HTTP_10 {
        has_connection_token(request.headers(), "keep-alive")
    } else {
        !has_connection_token(request.headers(), "close")
    }
}


fn body_allowed(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}


/// Best guess at a content type when a handler doesn't name one
pub(crate) fn sniff_content_type(body: &[u8]) -> &'static str {
    let start = body.iter().position(|b| !b" \t\r\n".contains(b)).unwrap_or(body.len());
    let lead = &body[start..];
    let html = [&b"<!doctype html"[..], &b"<html"[..], &b"<head"[..], &b"<body"[..]].iter()
        .any(|tag| lead.len() >= tag.len() && lead[..tag.len()].eq_ignore_ascii_case(tag));
    if html {
        return "text/html; charset=utf-8"
    }
    let binary = body.iter().any(|&b| b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r' && b != 0x0c && b != 0x1b);
    if !binary && ::std::str::from_utf8(body).is_ok() {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}


/// Status-line protocol for a reply: HTTP/1.0 clients get `HTTP/1.0` back
fn reply_protocol(request_version: Version) -> &'static str {
    if request_version == Version::HTTP_09 || request_version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}


/// Serialize `response` as an HTTP/1.x message.
///
/// Headers set by the handler are written as-is; `Connection`,
/// `Content-Length`, `Content-Type` and `Date` are filled in when missing.
/// `head_only` drops the body (answers to `HEAD`) but keeps its length.
pub(crate) fn serialize(response: &Response, request_version: Version, head_only: bool, keep_alive: bool) -> Vec<u8> {
    let status = response.status();
    let headers = response.headers();
    let body = response.body();
    let mut buf = Vec::with_capacity(128 + body.len());

    buf.extend_from_slice(format!("{} {} {}\r\n", reply_protocol(request_version), status.as_u16(),
                                  status.canonical_reason().unwrap_or("")).as_bytes());
    for (name, value) in headers.iter() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if !keep_alive && !has_connection_token(headers, "close") {
        buf.extend_from_slice(b"Connection: close\r\n");
    } else if keep_alive && request_version == Version::HTTP_10 && !headers.contains_key(CONNECTION) {
        buf.extend_from_slice(b"Connection: keep-alive\r\n");
    }
    let with_body = body_allowed(status);
    if with_body && !headers.contains_key(CONTENT_LENGTH) {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    if with_body && !body.is_empty() && !headers.contains_key(CONTENT_TYPE) {
        buf.extend_from_slice(format!("Content-Type: {}\r\n", sniff_content_type(body)).as_bytes());
    }
    if !headers.contains_key(DATE) {
        buf.extend_from_slice(format!("Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now())).as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    if with_body && !head_only {
        buf.extend_from_slice(body);
    }
    buf
}


/// Plain-text reply sent by the server itself, always closing the connection
pub(crate) fn error_response(status: StatusCode) -> Vec<u8> {
    let text = format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or(""));
    let mut response = Response::new(text.into_bytes());
    *response.status_mut() = status;
    serialize(&response, Version::HTTP_11, false, false)
}
