//! Single-threaded, event-driven HTTP/1.1 origin server for static content.
//!
//! The crate is built around four interlocking pieces: an edge-triggered
//! readiness demultiplexer with a deadline index (the [`Reactor`]), a
//! fixed-cardinality [`Pool`] of connection records, an incremental
//! byte-wise request parser with target canonicalization (the [`http`]
//! module), and the per-connection state machine that strings them together
//! (the [`Server`]).
//!
//! Everything runs on one thread: handlers are invoked by the reactor loop,
//! run to completion, and suspend only by returning on `WouldBlock`. There
//! are no locks and no atomics in the core; parallelism, if wanted, is a
//! matter of running independent server processes.
//!
//! Linux only — readiness comes from epoll and bodies are moved with
//! `sendfile(2)`.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//!
//! use ember::{Config, Server};
//!
//! # fn main() -> std::io::Result<()> {
//! let config = Config {
//!     root: "/srv/www".into(),
//!     ..Config::default()
//! };
//! let mut server = Server::new(config)?;
//!
//! let shutdown = AtomicBool::new(false);
//! server.run(&shutdown)
//! # }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("ember requires epoll and sendfile; only Linux is supported");

mod arena;
mod buffer;
mod conn;
pub mod http;
mod reactor;
mod server;
pub mod sys;
mod timer;
mod token;

pub use crate::arena::Arena;
pub use crate::buffer::Buffer;
pub use crate::conn::{Connection, Direction, Handler, IoEvent, Pool};
pub use crate::reactor::{Reactor, Readiness};
pub use crate::server::{Config, Server};
pub use crate::timer::{TimeMs, TimerIndex, TimerKey};
pub use crate::token::Token;
