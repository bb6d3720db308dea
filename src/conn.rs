//! Connection records and the fixed-size pool they live in.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::os::fd::RawFd;

use crate::http::Request;
use crate::sys;
use crate::timer::TimerKey;
use crate::Token;

/// The state machine position of an event, dispatched by the reactor loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Handler {
    /// Drain the listening socket's accept queue.
    Accept,
    /// Read and parse request bytes.
    Read,
    /// Map the parsed request onto the filesystem.
    Process,
    /// Flush the response header block.
    WriteHeaders,
    /// Stream the response body.
    WriteBody,
    /// Tear down or recycle the request.
    Finalize,
    /// Ignore the event. Parked direction of a connection that is busy on
    /// the other side.
    Empty,
}

/// One direction of interest on a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Per-direction event record.
///
/// `active` mirrors whether this direction is part of the connection's
/// kernel registration. `timeout` is set when the deadline index fires the
/// event and cleared by the handler that observes it. An armed deadline
/// keeps its [`TimerKey`] here; its presence is the "timer set" flag.
#[derive(Debug)]
pub struct IoEvent {
    pub active: bool,
    pub timeout: bool,
    pub handler: Handler,
    pub(crate) timer_key: Option<TimerKey>,
}

impl IoEvent {
    fn new() -> IoEvent {
        IoEvent {
            active: false,
            timeout: false,
            handler: Handler::Empty,
            timer_key: None,
        }
    }

    pub fn timer_set(&self) -> bool {
        self.timer_key.is_some()
    }

    fn reset(&mut self) {
        self.active = false;
        self.timeout = false;
        self.handler = Handler::Empty;
        debug_assert!(self.timer_key.is_none(), "freed event still in timer index");
        self.timer_key = None;
    }
}

/// A pooled connection: an fd (or the closed sentinel), its two event
/// records, and the in-flight request, if any.
///
/// Exactly one record owns a live fd. Once the fd is cleared back to the
/// sentinel, the record is detached: no demultiplexer operation may touch it
/// until it is re-assigned, and the dispatch loop uses that as the signal
/// that pending readiness for the old fd has expired.
pub struct Connection {
    fd: RawFd,
    pub read: IoEvent,
    pub write: IoEvent,
    pub request: Option<Request>,
    pub keep_alive: bool,
    token: Token,
}

impl Connection {
    fn new(token: Token) -> Connection {
        Connection {
            fd: sys::CLOSED,
            read: IoEvent::new(),
            write: IoEvent::new(),
            request: None,
            keep_alive: false,
            token,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_fd(&mut self, fd: RawFd) {
        debug_assert!(self.fd == sys::CLOSED, "connection already owns an fd");
        self.fd = fd;
    }

    pub(crate) fn clear_fd(&mut self) {
        self.fd = sys::CLOSED;
    }

    pub fn is_closed(&self) -> bool {
        self.fd == sys::CLOSED
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// The event record for one direction.
    pub fn event(&self, dir: Direction) -> &IoEvent {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token.0)
            .field("fd", &self.fd)
            .field("keep_alive", &self.keep_alive)
            .field("read", &self.read)
            .field("write", &self.write)
            .finish()
    }
}

/// Fixed-cardinality pool of connection records.
///
/// Records are pre-allocated; [`get`] pops a cleared record off the free
/// list and [`free`] resets and returns it. The free count plus the in-use
/// count always equals the capacity.
///
/// [`get`]: Pool::get
/// [`free`]: Pool::free
pub struct Pool {
    conns: Vec<Connection>,
    free: Vec<Token>,
}

impl Pool {
    pub fn with_capacity(capacity: usize) -> Pool {
        let conns = (0..capacity).map(|i| Connection::new(Token(i))).collect();
        // LIFO free list; popping yields the lowest tokens first.
        let free = (0..capacity).rev().map(Token).collect();
        Pool { conns, free }
    }

    /// Acquires a cleared record, or `None` when the pool is exhausted.
    pub fn get(&mut self) -> Option<Token> {
        let token = self.free.pop()?;
        let conn = &mut self.conns[token.0];
        debug_assert!(conn.is_closed());
        debug_assert!(!conn.read.active && !conn.write.active);
        Some(token)
    }

    /// Returns a record to the free list.
    ///
    /// The record must already be detached from the demultiplexer (fd is the
    /// sentinel). Freeing a record twice is a programmer error.
    pub fn free(&mut self, token: Token) {
        debug_assert!(!self.free.contains(&token), "connection freed twice");
        let conn = &mut self.conns[token.0];
        debug_assert!(conn.is_closed(), "freeing a connection that owns an fd");
        conn.read.reset();
        conn.write.reset();
        conn.request = None;
        conn.keep_alive = false;
        self.free.push(token);
    }

    pub fn in_use(&self) -> usize {
        self.conns.len() - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.conns.len()
    }
}

impl Index<Token> for Pool {
    type Output = Connection;

    fn index(&self, token: Token) -> &Connection {
        &self.conns[token.0]
    }
}

impl IndexMut<Token> for Pool {
    fn index_mut(&mut self, token: Token) -> &mut Connection {
        &mut self.conns[token.0]
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.conns.len())
            .field("in_use", &self.in_use())
            .finish()
    }
}
