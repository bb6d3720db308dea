//! The HTTP engine: incremental parsing, target canonicalization, and
//! per-request state.

pub mod parser;
pub mod request;
pub mod uri;

pub use self::parser::{InvalidRequest, Method, Parse, Parser, Version};
pub use self::request::{content_type_for, HeaderNotes, Request, StatusCode};
pub use self::uri::{canonicalize, CanonicalError, CanonicalUri};
