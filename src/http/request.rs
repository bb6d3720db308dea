//! Per-connection request state.
//!
//! A [`Request`] is created when the first byte of a request cycle arrives
//! and dropped when the response is finalized, on hard error, or on peer
//! close — a keep-alive connection gets a fresh one per cycle, so no parser
//! state survives reuse.

use std::fmt;
use std::fs::File;

use crate::arena::Arena;
use crate::buffer::Buffer;
use crate::http::parser::Parser;

/// Inbound header buffer size. A request line that overflows it is refused
/// with `414`, a header block with `431`.
pub const HEADER_IN_SIZE: usize = 4096;
/// Outbound header buffer size; the fixed response header block is a few
/// hundred bytes at most.
pub const HEADER_OUT_SIZE: usize = 4096;

/// The response status codes this server emits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    RequestTimeout,
    LengthRequired,
    PayloadTooLarge,
    UriTooLong,
    HeaderFieldsTooLarge,
    InternalServerError,
    NotImplemented,
}

impl StatusCode {
    /// The status line tail: code and reason phrase.
    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Ok => "200 OK",
            StatusCode::BadRequest => "400 Bad Request",
            StatusCode::Forbidden => "403 Forbidden",
            StatusCode::NotFound => "404 Not Found",
            StatusCode::RequestTimeout => "408 Request Timeout",
            StatusCode::LengthRequired => "411 Length Required",
            StatusCode::PayloadTooLarge => "413 Payload Too Large",
            StatusCode::UriTooLong => "414 URI Too Long",
            StatusCode::HeaderFieldsTooLarge => "431 Request Header Fields Too Large",
            StatusCode::InternalServerError => "500 Internal Server Error",
            StatusCode::NotImplemented => "501 Not Implemented",
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, StatusCode::Ok)
    }
}

/// Facts picked out of the header callbacks while parsing.
#[derive(Debug, Default)]
pub struct HeaderNotes {
    /// `Connection: keep-alive` (true) or `Connection: close` (false).
    pub connection: Option<bool>,
    pub has_content_length: bool,
}

impl HeaderNotes {
    pub fn note(&mut self, name: &[u8], value: &[u8]) {
        if name.eq_ignore_ascii_case(b"connection") {
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.connection = Some(true);
            } else if value.eq_ignore_ascii_case(b"close") {
                self.connection = Some(false);
            }
        } else if name.eq_ignore_ascii_case(b"content-length") {
            self.has_content_length = true;
        }
    }
}

pub struct Request {
    pub parser: Parser,
    pub headers: HeaderNotes,
    /// Scratch for this request cycle; the canonical path lives here.
    pub arena: Arena,
    pub header_in: Buffer,
    pub header_out: Buffer,
    pub status: StatusCode,
    /// Open file for the response body; `None` for errors and HEAD.
    pub file: Option<File>,
    /// Value of the `Content-Length` response header.
    pub content_length: u64,
    /// Body bytes still to transfer.
    pub remaining: u64,
    pub content_type: &'static str,
}

impl Request {
    pub fn new() -> Request {
        Request {
            parser: Parser::new(),
            headers: HeaderNotes::default(),
            arena: Arena::default(),
            header_in: Buffer::with_capacity(HEADER_IN_SIZE),
            header_out: Buffer::with_capacity(HEADER_OUT_SIZE),
            status: StatusCode::Ok,
            file: None,
            content_length: 0,
            remaining: 0,
            content_type: "text/html",
        }
    }

    /// Fills `header_out` with the fixed response header block:
    /// status line, `Server`, `Content-Type`, `Content-Length`, and the
    /// connection disposition.
    pub fn write_response_headers(&mut self, keep_alive: bool) -> std::io::Result<()> {
        debug_assert!(self.header_out.is_empty());

        let out = &mut self.header_out;
        out.write(b"HTTP/1.1 ")?;
        out.write(self.status.reason().as_bytes())?;
        out.write(b"\r\nServer: ember\r\nContent-Type: ")?;
        out.write(self.content_type.as_bytes())?;
        out.write(b"\r\nContent-Length: ")?;
        out.write(self.content_length.to_string().as_bytes())?;
        if keep_alive {
            out.write(b"\r\nConnection: keep-alive\r\n\r\n")?;
        } else {
            out.write(b"\r\nConnection: close\r\n\r\n")?;
        }
        Ok(())
    }
}

impl Default for Request {
    fn default() -> Request {
        Request::new()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("parser", &self.parser)
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// Content types by file extension; anything unrecognized is served as
/// `text/html`.
pub fn content_type_for(extension: Option<&[u8]>) -> &'static str {
    let extension = match extension {
        Some(extension) => extension,
        None => return "text/html",
    };
    match extension {
        b"html" | b"htm" => "text/html",
        b"css" => "text/css",
        b"js" => "application/javascript",
        b"json" => "application/json",
        b"txt" => "text/plain",
        b"png" => "image/png",
        b"jpg" | b"jpeg" => "image/jpeg",
        b"gif" => "image/gif",
        b"svg" => "image/svg+xml",
        b"ico" => "image/x-icon",
        b"pdf" => "application/pdf",
        _ => "text/html",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_headers_for_success() {
        let mut request = Request::new();
        request.content_length = 13;
        request.write_response_headers(true).unwrap();
        let headers = request.header_out.readable();
        let text = std::str::from_utf8(headers).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Server: ember\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains("Content-Length: 13\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_headers_for_error() {
        let mut request = Request::new();
        request.status = StatusCode::NotFound;
        request.write_response_headers(false).unwrap();
        let text = std::str::from_utf8(request.header_out.readable()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn header_notes() {
        let mut notes = HeaderNotes::default();
        notes.note(b"Host", b"example.com");
        assert_eq!(notes.connection, None);

        notes.note(b"CONNECTION", b"Keep-Alive");
        assert_eq!(notes.connection, Some(true));

        notes.note(b"Connection", b"close");
        assert_eq!(notes.connection, Some(false));

        assert!(!notes.has_content_length);
        notes.note(b"Content-Length", b"42");
        assert!(notes.has_content_length);
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for(Some(b"css")), "text/css");
        assert_eq!(content_type_for(Some(b"png")), "image/png");
        assert_eq!(content_type_for(Some(b"weird")), "text/html");
        assert_eq!(content_type_for(None), "text/html");
    }
}
