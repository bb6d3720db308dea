//! Request-target canonicalization.
//!
//! Turns the raw `[uri_start, uri_end)` bytes of a parsed request into a
//! filesystem path under the document root: percent-escapes decoded,
//! fragment stripped, query appended verbatim. The output is built in the
//! request's arena, so it lives exactly as long as the request does.
//!
//! Canonicalization does not interpret `.` or `..` segments; deciding what
//! to do about parent references is the filesystem binding's business (see
//! [`CanonicalUri::rel_segments`]).

use std::error;
use std::fmt;

use crate::arena::Arena;

/// Why a request target could not be canonicalized.
#[derive(Debug, PartialEq, Eq)]
pub enum CanonicalError {
    /// Grammar violation: non-absolute target, a `/` inside the query, or a
    /// malformed percent escape.
    Invalid,
    /// The arena could not hold the canonical form.
    OutOfMemory,
}

impl fmt::Display for CanonicalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalError::Invalid => f.write_str("invalid request target"),
            CanonicalError::OutOfMemory => f.write_str("request target too long to canonicalize"),
        }
    }
}

impl error::Error for CanonicalError {}

/// A canonicalized target: `root ∥ "/" ∥ path [∥ "?" ∥ query]`.
#[derive(Debug)]
pub struct CanonicalUri<'a> {
    bytes: &'a [u8],
    root_len: usize,
    /// End of the path portion; the query, if any, starts here with `?`.
    path_end: usize,
    /// Offset of the last `.` in the path portion, segment-local.
    last_dot: Option<usize>,
}

impl<'a> CanonicalUri<'a> {
    /// The whole canonical path, as handed to the filesystem.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The extension after the last dot of the final path segment, if any.
    /// Used for content typing.
    pub fn extension(&self) -> Option<&'a [u8]> {
        self.last_dot.map(|dot| &self.bytes[dot + 1..self.path_end])
    }

    /// Path segments below the document root, query excluded.
    pub fn rel_segments(&self) -> impl Iterator<Item = &'a [u8]> {
        self.bytes[self.root_len..self.path_end]
            .split(|&b| b == b'/')
            .filter(|segment| !segment.is_empty())
    }
}

enum State {
    Start,
    AfterSlash,
    Query,
}

/// Builds the canonical filesystem path for `uri` under `root`.
///
/// `uri` must be the span recorded by the parser: absolute, no spaces, no
/// control bytes. `%XX` escapes decode into the output; `#` ends parsing;
/// `?` switches to the query, inside which `/` is refused. Escapes are not
/// re-decoded, so canonicalizing an output again reproduces it.
pub fn canonicalize<'a>(
    arena: &'a Arena,
    root: &[u8],
    uri: &[u8],
) -> Result<CanonicalUri<'a>, CanonicalError> {
    // Worst case the output is root + '/' + uri, plus slack for the NUL
    // padding the arena provides anyway.
    let out = arena
        .alloc_zeroed(root.len() + uri.len() + 32)
        .map_err(|_| CanonicalError::OutOfMemory)?;

    fn push(out: &mut [u8], len: &mut usize, b: u8) {
        out[*len] = b;
        *len += 1;
    }

    let mut len = 0;
    let mut state = State::Start;
    let mut last_dot = None;
    let mut path_end = None;

    let mut iter = uri.iter().copied();
    while let Some(c) = iter.next() {
        match state {
            State::Start => match c {
                b'/' => {
                    for &b in root {
                        push(out, &mut len, b);
                    }
                    push(out, &mut len, b'/');
                    state = State::AfterSlash;
                }
                _ => return Err(CanonicalError::Invalid),
            },

            State::AfterSlash => match c {
                b'/' => {
                    push(out, &mut len, b'/');
                    last_dot = None;
                }
                b'#' => break,
                b'?' => {
                    path_end = Some(len);
                    push(out, &mut len, b'?');
                    state = State::Query;
                }
                b'%' => {
                    let hi = hex_value(iter.next().ok_or(CanonicalError::Invalid)?)?;
                    let lo = hex_value(iter.next().ok_or(CanonicalError::Invalid)?)?;
                    push(out, &mut len, (hi << 4) | lo);
                }
                b'.' => {
                    last_dot = Some(len);
                    push(out, &mut len, b'.');
                }
                _ => push(out, &mut len, c),
            },

            State::Query => match c {
                b'#' => break,
                b'/' => return Err(CanonicalError::Invalid),
                _ => push(out, &mut len, c),
            },
        }
    }

    if matches!(state, State::Start) {
        // Empty target; the parser never produces one, but be strict.
        return Err(CanonicalError::Invalid);
    }

    Ok(CanonicalUri {
        bytes: &out[..len],
        root_len: root.len(),
        path_end: path_end.unwrap_or(len),
        last_dot,
    })
}

fn hex_value(c: u8) -> Result<u8, CanonicalError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(CanonicalError::Invalid),
    }
}
