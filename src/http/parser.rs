//! Incremental HTTP/1.1 request parser.
//!
//! The parser walks the inbound [`Buffer`] one byte at a time and suspends
//! wherever the bytes run out; feeding it the same stream in any chunking
//! yields the same result. Consumed bytes are never re-scanned. The request
//! target is not copied out: the parser records its absolute span in the
//! buffer, which never relocates data.

use std::error;
use std::fmt;
use std::ops::Range;

use crate::buffer::Buffer;

/// Request methods recognized on the wire. Only GET and HEAD are served;
/// the rest parse and are then refused with `501 Not Implemented`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Options,
    Delete,
    Trace,
    Connect,
}

impl Method {
    /// First-letter dispatch; the rest of the token is matched byte-exact.
    fn from_initial(byte: u8) -> Option<Method> {
        match byte {
            b'G' => Some(Method::Get),
            b'H' => Some(Method::Head),
            b'P' => Some(Method::Post),
            b'O' => Some(Method::Options),
            b'D' => Some(Method::Delete),
            b'T' => Some(Method::Trace),
            b'C' => Some(Method::Connect),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Options => "OPTIONS",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// Outcome of a parse call that did not hit a protocol error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Parse {
    /// The grammar production is complete.
    Complete,
    /// Ran out of bytes mid-state; refill the buffer and call again.
    Partial,
}

/// The request violated the grammar. Terminal: the parser refuses further
/// input once this has been returned.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidRequest;

impl fmt::Display for InvalidRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid HTTP request")
    }
}

impl error::Error for InvalidRequest {}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    Start,
    Method,
    SpaceBeforeUri,
    Uri,
    SpaceBeforeVersion,
    VersionH,
    VersionHt,
    VersionHtt,
    VersionHttp,
    VersionSlash,
    VersionMajor,
    VersionDot,
    SpaceAfterVersion,
    LineAlmostDone,
    LineDone,
    HeaderStart,
    HeaderName,
    SpaceBeforeValue,
    HeaderValue,
    HeaderAlmostDone,
    AllHeadersAlmostDone,
    AllDone,
    Error,
}

pub struct Parser {
    state: State,
    method: Option<Method>,
    version: Option<Version>,
    /// Byte position inside the method token while matching it.
    index: usize,
    uri_start: usize,
    uri_end: usize,
    name_start: usize,
    name_end: usize,
    value_start: usize,
}

impl Parser {
    pub fn new() -> Parser {
        Parser {
            state: State::Start,
            method: None,
            version: None,
            index: 0,
            uri_start: 0,
            uri_end: 0,
            name_start: 0,
            name_end: 0,
            value_start: 0,
        }
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Absolute span of the request target in the inbound buffer, available
    /// once the request line is done.
    pub fn uri(&self) -> Option<Range<usize>> {
        if self.state >= State::LineDone && self.state != State::Error {
            Some(self.uri_start..self.uri_end)
        } else {
            None
        }
    }

    /// True until the request line has completed; decides whether an
    /// overflowing inbound buffer means `414` or `431`.
    pub fn in_request_line(&self) -> bool {
        self.state < State::LineDone
    }

    pub fn is_done(&self) -> bool {
        self.state == State::AllDone
    }

    /// Drives the request line and then the header block. `on_header` fires
    /// for each completed name/value pair with slices borrowed from `buf`;
    /// a value containing spaces fires once per word, with the value slice
    /// restarting after each space.
    pub fn parse(
        &mut self,
        buf: &mut Buffer,
        mut on_header: impl FnMut(&[u8], &[u8]),
    ) -> Result<Parse, InvalidRequest> {
        if self.in_request_line() {
            match self.parse_request_line(buf)? {
                Parse::Partial => return Ok(Parse::Partial),
                Parse::Complete => {}
            }
        }
        if self.state != State::AllDone {
            return self.parse_headers(buf, &mut on_header);
        }
        Ok(Parse::Complete)
    }

    /// Parses `METHOD SP URI SP HTTP/1.x CRLF`, consuming through the line
    /// terminator.
    pub fn parse_request_line(&mut self, buf: &mut Buffer) -> Result<Parse, InvalidRequest> {
        debug_assert!(self.state != State::Error, "parser re-entered after error");
        let mut state = self.state;

        while let Some(c) = buf.peek() {
            match state {
                State::Start => {
                    let method = match Method::from_initial(c) {
                        Some(method) => method,
                        None => return self.fail(),
                    };
                    self.method = Some(method);
                    self.index = 1;
                    state = State::Method;
                }

                State::Method => {
                    let token = self.method.unwrap().as_str().as_bytes();
                    if self.index < token.len() {
                        if token[self.index] != c {
                            return self.fail();
                        }
                        self.index += 1;
                    } else {
                        // Token matched; this byte is the separator.
                        state = State::SpaceBeforeUri;
                    }
                }

                State::SpaceBeforeUri => match c {
                    b' ' => {}
                    b'/' => {
                        self.uri_start = buf.read_pos();
                        state = State::Uri;
                    }
                    _ => return self.fail(),
                },

                State::Uri => match c {
                    b' ' => {
                        self.uri_end = buf.read_pos();
                        state = State::SpaceBeforeVersion;
                    }
                    c if !is_ctl(c) => {}
                    _ => return self.fail(),
                },

                State::SpaceBeforeVersion => match c {
                    b' ' => {}
                    c if c | 0x20 == b'h' => state = State::VersionH,
                    _ => return self.fail(),
                },

                State::VersionH => match c {
                    c if c | 0x20 == b't' => state = State::VersionHt,
                    _ => return self.fail(),
                },

                State::VersionHt => match c {
                    c if c | 0x20 == b't' => state = State::VersionHtt,
                    _ => return self.fail(),
                },

                State::VersionHtt => match c {
                    c if c | 0x20 == b'p' => state = State::VersionHttp,
                    _ => return self.fail(),
                },

                State::VersionHttp => match c {
                    b'/' => state = State::VersionSlash,
                    _ => return self.fail(),
                },

                State::VersionSlash => match c {
                    b'1' => state = State::VersionMajor,
                    _ => return self.fail(),
                },

                State::VersionMajor => match c {
                    b'.' => state = State::VersionDot,
                    _ => return self.fail(),
                },

                State::VersionDot => match c {
                    b'0' => {
                        self.version = Some(Version::Http10);
                        state = State::SpaceAfterVersion;
                    }
                    b'1' => {
                        self.version = Some(Version::Http11);
                        state = State::SpaceAfterVersion;
                    }
                    _ => return self.fail(),
                },

                State::SpaceAfterVersion => match c {
                    b' ' => {}
                    b'\r' => state = State::LineAlmostDone,
                    _ => return self.fail(),
                },

                State::LineAlmostDone => match c {
                    b'\n' => {
                        buf.consume(1);
                        self.state = State::LineDone;
                        return Ok(Parse::Complete);
                    }
                    _ => return self.fail(),
                },

                _ => unreachable!("request-line parser in state {:?}", state),
            }
            buf.consume(1);
            self.state = state;
        }

        Ok(Parse::Partial)
    }

    /// Parses the header block through the terminating empty line.
    pub fn parse_headers(
        &mut self,
        buf: &mut Buffer,
        on_header: &mut impl FnMut(&[u8], &[u8]),
    ) -> Result<Parse, InvalidRequest> {
        debug_assert!(self.state != State::Error, "parser re-entered after error");
        if self.state == State::LineDone {
            self.state = State::HeaderStart;
        }
        let mut state = self.state;

        while let Some(c) = buf.peek() {
            match state {
                State::HeaderStart => match c {
                    b'\r' => state = State::AllHeadersAlmostDone,
                    c if c.is_ascii_alphabetic() || c == b'-' => {
                        self.name_start = buf.read_pos();
                        state = State::HeaderName;
                    }
                    _ => return self.fail(),
                },

                State::HeaderName => match c {
                    c if c.is_ascii_alphabetic() || c == b'-' => {}
                    b':' => {
                        self.name_end = buf.read_pos();
                        state = State::SpaceBeforeValue;
                    }
                    _ => return self.fail(),
                },

                State::SpaceBeforeValue => match c {
                    b' ' => {}
                    c if !is_ctl(c) => {
                        self.value_start = buf.read_pos();
                        state = State::HeaderValue;
                    }
                    _ => return self.fail(),
                },

                State::HeaderValue => match c {
                    b'\r' | b' ' => {
                        on_header(
                            buf.bytes(self.name_start..self.name_end),
                            buf.bytes(self.value_start..buf.read_pos()),
                        );
                        state = if c == b'\r' {
                            State::HeaderAlmostDone
                        } else {
                            State::SpaceBeforeValue
                        };
                    }
                    c if !is_ctl(c) => {}
                    _ => return self.fail(),
                },

                State::HeaderAlmostDone => match c {
                    b'\n' => state = State::HeaderStart,
                    _ => return self.fail(),
                },

                State::AllHeadersAlmostDone => match c {
                    b'\n' => {
                        buf.consume(1);
                        self.state = State::AllDone;
                        return Ok(Parse::Complete);
                    }
                    _ => return self.fail(),
                },

                _ => unreachable!("header parser in state {:?}", state),
            }
            buf.consume(1);
            self.state = state;
        }

        Ok(Parse::Partial)
    }

    fn fail(&mut self) -> Result<Parse, InvalidRequest> {
        self.state = State::Error;
        Err(InvalidRequest)
    }
}

impl Default for Parser {
    fn default() -> Parser {
        Parser::new()
    }
}

impl fmt::Debug for Parser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parser")
            .field("state", &self.state)
            .field("method", &self.method)
            .field("version", &self.version)
            .finish()
    }
}

fn is_ctl(c: u8) -> bool {
    c < 0x20 || c == 0x7f
}
