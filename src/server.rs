//! The static-file origin server: accept loop, per-connection state
//! machine, and the response path.
//!
//! Every piece of work is a handler invoked by the dispatch loop, either
//! for kernel readiness or for an expired deadline. Handlers run to
//! completion and suspend only by returning; `WouldBlock` means "wait for
//! the next readiness", `Interrupted` retries in place, and a broken peer
//! tears the connection down. A handler may advance the state machine and
//! invoke the next handler for the same connection synchronously, but never
//! for a different one, and never across a request-cycle boundary: a
//! finished keep-alive cycle returns to the dispatch loop, which re-enters
//! the read side iteratively (see [`Server::drive`]), keeping the call
//! stack bounded no matter how many requests a connection serves.

use std::fs::{self, File};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, warn};

use crate::conn::{Direction, Handler, Pool};
use crate::http::{
    canonicalize, content_type_for, CanonicalError, Method, Parse, Request, StatusCode, Version,
};
use crate::reactor::{Reactor, Readiness};
use crate::sys;
use crate::Token;

#[derive(Clone, Debug)]
pub struct Config {
    /// Document root that request targets resolve under.
    pub root: PathBuf,
    /// Listen port; 0 picks an ephemeral port.
    pub port: u16,
    /// Connection records, one of which is taken by the listener.
    pub max_connections: usize,
    /// Kernel events accepted per reactor tick.
    pub max_events: usize,
    /// Read-side inactivity deadline.
    pub request_timeout_ms: u64,
    /// Answer a read timeout with `408 Request Timeout` instead of closing
    /// silently.
    pub timeout_response: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            root: PathBuf::from("."),
            port: 9877,
            max_connections: 128,
            max_events: 128,
            request_timeout_ms: 5000,
            timeout_response: false,
        }
    }
}

/// Longest a tick may block while no deadline is armed, so the shutdown
/// flag is observed promptly.
const MAX_IDLE_POLL_MS: u64 = 1000;

enum IoOutcome {
    /// The buffer in flight is done; move to the next state.
    Done,
    /// `WouldBlock`; wait for the next readiness event.
    Yield,
    /// The peer is gone or the fd is beyond use.
    PeerGone,
}

pub struct Server {
    config: Config,
    /// Document root bytes, trailing slashes stripped.
    root: Vec<u8>,
    reactor: Reactor,
    pool: Pool,
    listener: OwnedFd,
    /// Set by a finalized keep-alive cycle to ask [`drive`] for another pass
    /// over the same connection. Handlers run one request cycle at most;
    /// successive buffered requests are served iteratively from the
    /// dispatch loop, never by handlers re-entering each other across
    /// cycle boundaries.
    ///
    /// [`drive`]: Server::drive
    resume: Option<Token>,
}

impl Server {
    pub fn new(config: Config) -> io::Result<Server> {
        if config.max_connections < 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "max_connections must be at least 2; the listener occupies one record",
            ));
        }

        let reactor = Reactor::new(config.max_events)?;
        let mut pool = Pool::with_capacity(config.max_connections);
        let listener = sys::tcp_listen(config.port)?;

        let mut root = config.root.as_os_str().as_bytes().to_vec();
        while root.len() > 1 && root.last() == Some(&b'/') {
            root.pop();
        }

        let token = pool.get().expect("fresh pool has a free record");
        let conn = &mut pool[token];
        conn.set_fd(listener.as_raw_fd());
        conn.read.handler = Handler::Accept;
        reactor.enable(conn, Direction::Read)?;

        Ok(Server {
            config,
            root,
            reactor,
            pool,
            listener,
            resume: None,
        })
    }

    /// The port the listener is bound to; useful with `port: 0`.
    pub fn local_port(&self) -> io::Result<u16> {
        sys::local_port(self.listener.as_raw_fd())
    }

    /// Number of connection records in use, the listener's included.
    pub fn connections_in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// Runs the reactor loop until `shutdown` is observed set.
    ///
    /// A signal arriving during the poll interrupts it and re-checks the
    /// flag; pending connections are abandoned on exit and reclaimed by the
    /// OS with the process.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        debug!("listening on port {}", self.local_port()?);
        while !shutdown.load(Ordering::Relaxed) {
            match self.tick() {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        debug!("server quit");
        Ok(())
    }

    /// One reactor tick: wait for readiness within the timer budget,
    /// dispatch I/O handlers, then fire expired deadlines.
    fn tick(&mut self) -> io::Result<usize> {
        let budget = self
            .reactor
            .timer_recent()
            .unwrap_or(MAX_IDLE_POLL_MS)
            .min(MAX_IDLE_POLL_MS);

        let n_events = self.reactor.poll(Some(budget))?;

        for i in 0..n_events {
            let readiness = self.reactor.readiness(i);
            self.dispatch(readiness);
        }

        while let Some(token) = self.reactor.expire(&mut self.pool) {
            let handler = self.pool[token].read.handler;
            self.drive(handler, token);
        }

        Ok(n_events)
    }

    fn dispatch(&mut self, readiness: Readiness) {
        let token = readiness.token;
        // On error or peer close both handlers run and observe the
        // condition through their next syscall.
        let readable = readiness.readable || readiness.error;
        let writable = readiness.writable || readiness.error;

        if readable && self.pool[token].read.active {
            let handler = self.pool[token].read.handler;
            self.drive(handler, token);
        }

        // The read handler may have closed the connection; a record without
        // an fd means the readiness has expired.
        let conn = &self.pool[token];
        if writable && conn.write.active && !conn.is_closed() {
            let handler = conn.write.handler;
            self.drive(handler, token);
        }
    }

    /// Runs one connection's current handler, then keeps re-entering its
    /// read side for as long as finalized keep-alive cycles ask to resume.
    ///
    /// This is the only place a new request cycle starts, so serving any
    /// number of back-to-back buffered requests is iteration here, not
    /// call-stack recursion through the handlers.
    fn drive(&mut self, handler: Handler, token: Token) {
        self.run_handler(handler, token);
        while let Some(next) = self.resume.take() {
            debug_assert_eq!(next, token, "handler resumed a different connection");
            let handler = self.pool[next].read.handler;
            self.run_handler(handler, next);
        }
    }

    fn run_handler(&mut self, handler: Handler, token: Token) {
        match handler {
            Handler::Accept => self.accept_handler(token),
            Handler::Read => self.read_handler(token),
            Handler::Process => self.process_handler(token),
            Handler::WriteHeaders => self.write_headers_handler(token),
            Handler::WriteBody => self.write_body_handler(token),
            Handler::Finalize => self.finalize_handler(token),
            Handler::Empty => {}
        }
    }

    /// Drains the accept queue. Edge triggering means the queue must be
    /// emptied here; with the pool exhausted, sockets are still taken from
    /// the kernel and closed so clients see a reset instead of a dead wait.
    fn accept_handler(&mut self, token: Token) {
        let listen_fd = self.pool[token].fd();
        loop {
            let fd = match sys::accept(listen_fd) {
                Ok(fd) => fd,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("accept: {e}");
                    return;
                }
            };

            let conn_token = match self.pool.get() {
                Some(conn_token) => conn_token,
                None => {
                    warn!("connection pool exhausted, refusing fd {fd}");
                    let _ = sys::close(fd);
                    continue;
                }
            };

            let timeout_ms = self.config.request_timeout_ms;
            let conn = &mut self.pool[conn_token];
            conn.set_fd(fd);
            conn.read.handler = Handler::Read;
            conn.write.handler = Handler::Empty;
            if let Err(e) = self.reactor.register_rw(conn) {
                error!("register fd {fd}: {e}");
                conn.clear_fd();
                let _ = sys::close(fd);
                self.pool.free(conn_token);
                continue;
            }
            self.reactor.timer_add(conn, timeout_ms);
            debug!("new connection fd {fd} (token {})", conn_token.0);
        }
    }

    /// Reads request bytes and advances the parser until the request is
    /// complete, refused, or the socket runs dry.
    fn read_handler(&mut self, token: Token) {
        enum ReadOutcome {
            Parsed,
            Refuse(StatusCode),
            PeerGone,
        }

        if self.pool[token].read.timeout {
            self.pool[token].read.timeout = false;
            self.read_timeout(token);
            return;
        }

        let timeout_ms = self.config.request_timeout_ms;
        let outcome = 'io: {
            let conn = &mut self.pool[token];
            let fd = conn.fd();
            let request = conn.request.get_or_insert_with(Request::new);
            loop {
                if request.header_in.is_full() {
                    break 'io ReadOutcome::Refuse(if request.parser.in_request_line() {
                        StatusCode::UriTooLong
                    } else {
                        StatusCode::HeaderFieldsTooLarge
                    });
                }

                match sys::read(fd, request.header_in.writable()) {
                    Ok(0) => break 'io ReadOutcome::PeerGone,
                    Ok(n) => request.header_in.fill(n),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if !conn.read.timer_set() {
                            self.reactor.timer_add(conn, timeout_ms);
                        }
                        return;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        break 'io ReadOutcome::PeerGone
                    }
                    Err(e) => {
                        error!("read fd {fd}: {e}");
                        break 'io ReadOutcome::PeerGone;
                    }
                }

                let Request {
                    parser,
                    header_in,
                    headers,
                    ..
                } = request;
                match parser.parse(header_in, |name, value| headers.note(name, value)) {
                    Ok(Parse::Complete) => break 'io ReadOutcome::Parsed,
                    Ok(Parse::Partial) => continue,
                    Err(_) => break 'io ReadOutcome::Refuse(StatusCode::BadRequest),
                }
            }
        };

        match outcome {
            ReadOutcome::Parsed => {
                let conn = &mut self.pool[token];
                self.reactor.timer_del(conn);
                let request = conn.request.as_ref().unwrap();
                let explicit = request.headers.connection;
                let version = request.parser.version();
                conn.keep_alive = explicit.unwrap_or(version == Some(Version::Http11));
                conn.read.handler = Handler::Process;
                self.process_handler(token);
            }
            ReadOutcome::Refuse(status) => {
                let conn = &mut self.pool[token];
                self.reactor.timer_del(conn);
                conn.request.as_mut().unwrap().status = status;
                self.refuse(token);
            }
            ReadOutcome::PeerGone => {
                self.pool[token].request = None;
                self.close_connection(token);
            }
        }
    }

    /// Routes an already-set error status into the response path.
    fn refuse(&mut self, token: Token) {
        let conn = &mut self.pool[token];
        conn.keep_alive = false;
        conn.read.handler = Handler::Empty;
        conn.write.handler = Handler::WriteHeaders;
        self.write_headers_handler(token);
    }

    fn read_timeout(&mut self, token: Token) {
        debug!("request timeout (token {})", token.0);
        if self.config.timeout_response {
            let conn = &mut self.pool[token];
            let request = conn.request.get_or_insert_with(Request::new);
            request.status = StatusCode::RequestTimeout;
            self.refuse(token);
        } else {
            self.pool[token].request = None;
            self.close_connection(token);
        }
    }

    /// Maps the parsed request onto the filesystem and hands off to the
    /// response path.
    fn process_handler(&mut self, token: Token) {
        let status = {
            let conn = &mut self.pool[token];
            let request = conn.request.as_mut().unwrap();
            process_request(request, &self.root)
        };

        let conn = &mut self.pool[token];
        conn.request.as_mut().unwrap().status = status;
        if status.is_error() {
            conn.keep_alive = false;
        }
        conn.read.handler = Handler::Empty;
        conn.write.handler = Handler::WriteHeaders;
        self.write_headers_handler(token);
    }

    /// Builds the response header block on first entry, then flushes it.
    fn write_headers_handler(&mut self, token: Token) {
        let outcome = 'io: {
            let conn = &mut self.pool[token];
            let fd = conn.fd();
            let keep_alive = conn.keep_alive;
            let request = conn.request.as_mut().unwrap();

            if request.header_out.is_empty() {
                if request.write_response_headers(keep_alive).is_err() {
                    error!("response header block overflowed its buffer");
                    break 'io IoOutcome::PeerGone;
                }
            }

            loop {
                if request.header_out.is_empty() {
                    break 'io IoOutcome::Done;
                }
                match sys::write(fd, request.header_out.readable()) {
                    Ok(n) => request.header_out.consume(n),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        break 'io IoOutcome::Yield
                    }
                    Err(ref e) if is_peer_gone(e) => break 'io IoOutcome::PeerGone,
                    Err(e) => {
                        error!("write fd {fd}: {e}");
                        break 'io IoOutcome::PeerGone;
                    }
                }
            }
        };

        match outcome {
            IoOutcome::Done => {
                let conn = &mut self.pool[token];
                let next = if conn.request.as_ref().unwrap().file.is_some() {
                    Handler::WriteBody
                } else {
                    Handler::Finalize
                };
                conn.write.handler = next;
                self.run_handler(next, token);
            }
            IoOutcome::Yield => {}
            IoOutcome::PeerGone => {
                self.pool[token].request = None;
                self.close_connection(token);
            }
        }
    }

    /// Streams the response body file to the socket with zero-copy sends
    /// until every byte of the advertised length is out.
    fn write_body_handler(&mut self, token: Token) {
        let outcome = 'io: {
            let conn = &mut self.pool[token];
            let fd = conn.fd();
            let request = conn.request.as_mut().unwrap();
            let file_fd = match &request.file {
                Some(file) => file.as_raw_fd(),
                None => break 'io IoOutcome::Done,
            };

            loop {
                if request.remaining == 0 {
                    break 'io IoOutcome::Done;
                }
                let count = request.remaining.min(usize::MAX as u64) as usize;
                match sys::sendfile(fd, file_fd, count) {
                    Ok(0) => {
                        // The file shrank while we were sending; the
                        // advertised length can no longer be honored.
                        warn!("sendfile EOF with {} bytes unsent", request.remaining);
                        break 'io IoOutcome::PeerGone;
                    }
                    Ok(n) => request.remaining -= n as u64,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        break 'io IoOutcome::Yield
                    }
                    Err(ref e) if is_peer_gone(e) => break 'io IoOutcome::PeerGone,
                    Err(e) => {
                        error!("sendfile fd {fd}: {e}");
                        break 'io IoOutcome::PeerGone;
                    }
                }
            }
        };

        match outcome {
            IoOutcome::Done => {
                self.pool[token].write.handler = Handler::Finalize;
                self.finalize_handler(token);
            }
            IoOutcome::Yield => {}
            IoOutcome::PeerGone => {
                self.pool[token].request = None;
                self.close_connection(token);
            }
        }
    }

    /// Destroys the request and either recycles the connection for the next
    /// keep-alive cycle or closes it.
    fn finalize_handler(&mut self, token: Token) {
        let conn = &mut self.pool[token];
        conn.request = None;

        if !conn.keep_alive {
            self.close_connection(token);
            return;
        }

        conn.write.handler = Handler::Empty;
        conn.read.handler = Handler::Read;
        // Bytes of the next request may already be buffered in the kernel
        // and edge triggering will not re-announce them, so ask the dispatch
        // loop for another read pass rather than re-entering it from here.
        self.resume = Some(token);
    }

    /// The only cancellation point: deregister, disarm, close, release.
    fn close_connection(&mut self, token: Token) {
        let conn = &mut self.pool[token];
        debug_assert!(conn.request.is_none());
        let fd = conn.fd();
        self.reactor.timer_del(conn);
        if let Err(e) = self.reactor.deregister(conn) {
            error!("deregister fd {fd}: {e}");
        }
        if let Err(e) = sys::close(fd) {
            error!("close fd {fd}: {e}");
        }
        self.pool.free(token);
        debug!("closed connection fd {fd} (token {})", token.0);
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}

fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

/// Resolves a parsed request against the document root: canonicalize the
/// target, refuse parent traversal, stat, and open.
fn process_request(request: &mut Request, root: &[u8]) -> StatusCode {
    let method = match request.parser.method() {
        Some(method) => method,
        None => return StatusCode::BadRequest,
    };
    match method {
        Method::Get | Method::Head => {}
        Method::Post => {
            // No request-body support: a declared body is refused outright,
            // an undeclared one is asked to declare itself.
            return if request.headers.has_content_length {
                StatusCode::PayloadTooLarge
            } else {
                StatusCode::LengthRequired
            };
        }
        _ => return StatusCode::NotImplemented,
    }

    let uri = match request.parser.uri() {
        Some(uri) => uri,
        None => return StatusCode::BadRequest,
    };

    let (file, len, content_type) = {
        let canonical = match canonicalize(&request.arena, root, request.header_in.bytes(uri)) {
            Ok(canonical) => canonical,
            Err(CanonicalError::Invalid) => return StatusCode::BadRequest,
            Err(CanonicalError::OutOfMemory) => return StatusCode::InternalServerError,
        };

        // The canonical form preserves decoded `..` bytes; resolving them
        // is refused here so escapes cannot climb out of the root.
        if canonical.rel_segments().any(|segment| segment == b"..") {
            return StatusCode::Forbidden;
        }

        let content_type = content_type_for(canonical.extension());
        let path = Path::new(std::ffi::OsStr::from_bytes(canonical.as_bytes()));

        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => return status_for_fs_error(&e),
        };
        if metadata.is_dir() {
            return StatusCode::Forbidden;
        }

        if method == Method::Head {
            (None, metadata.len(), content_type)
        } else {
            match File::open(path) {
                Ok(file) => (Some(file), metadata.len(), content_type),
                Err(e) => return status_for_fs_error(&e),
            }
        }
    };

    request.content_length = len;
    request.remaining = if file.is_some() { len } else { 0 };
    request.file = file;
    request.content_type = content_type;
    StatusCode::Ok
}

fn status_for_fs_error(e: &io::Error) -> StatusCode {
    if e.raw_os_error() == Some(libc::ENOTDIR) {
        return StatusCode::NotFound;
    }
    match e.kind() {
        io::ErrorKind::NotFound => StatusCode::NotFound,
        io::ErrorKind::PermissionDenied => StatusCode::Forbidden,
        _ => StatusCode::InternalServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parsed(request_text: &str) -> Request {
        let mut request = Request::new();
        request.header_in.write(request_text.as_bytes()).unwrap();
        let Request {
            parser,
            header_in,
            headers,
            ..
        } = &mut request;
        parser
            .parse(header_in, |name, value| headers.note(name, value))
            .unwrap();
        assert!(request.parser.is_done());
        request
    }

    fn root_with_file(name: &str, contents: &[u8]) -> (tempfile::TempDir, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join(name)).unwrap();
        file.write_all(contents).unwrap();
        let root = dir.path().as_os_str().as_bytes().to_vec();
        (dir, root)
    }

    #[test]
    fn serves_existing_file() {
        let (_dir, root) = root_with_file("index.html", b"hello, world!");
        let mut request = parsed("GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(process_request(&mut request, &root), StatusCode::Ok);
        assert!(request.file.is_some());
        assert_eq!(request.content_length, 13);
        assert_eq!(request.remaining, 13);
    }

    #[test]
    fn head_stats_without_opening() {
        let (_dir, root) = root_with_file("a.txt", b"abc");
        let mut request = parsed("HEAD /a.txt HTTP/1.1\r\n\r\n");
        assert_eq!(process_request(&mut request, &root), StatusCode::Ok);
        assert!(request.file.is_none());
        assert_eq!(request.content_length, 3);
        assert_eq!(request.remaining, 0);
        assert_eq!(request.content_type, "text/plain");
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_dir, root) = root_with_file("present", b"x");
        let mut request = parsed("GET /absent.html HTTP/1.1\r\n\r\n");
        assert_eq!(process_request(&mut request, &root), StatusCode::NotFound);
        assert!(request.file.is_none());
        assert_eq!(request.content_length, 0);
    }

    #[test]
    fn directory_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let root = dir.path().as_os_str().as_bytes().to_vec();
        let mut request = parsed("GET /sub HTTP/1.1\r\n\r\n");
        assert_eq!(process_request(&mut request, &root), StatusCode::Forbidden);
    }

    #[test]
    fn encoded_traversal_is_forbidden() {
        let (_dir, root) = root_with_file("x", b"x");
        let mut request = parsed("GET /%2e%2e/secret HTTP/1.1\r\n\r\n");
        assert_eq!(process_request(&mut request, &root), StatusCode::Forbidden);
    }

    #[test]
    fn unsupported_methods() {
        let (_dir, root) = root_with_file("x", b"x");

        let mut request = parsed("DELETE /x HTTP/1.1\r\n\r\n");
        assert_eq!(process_request(&mut request, &root), StatusCode::NotImplemented);

        let mut request = parsed("POST /x HTTP/1.1\r\n\r\n");
        assert_eq!(process_request(&mut request, &root), StatusCode::LengthRequired);

        let mut request = parsed("POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(process_request(&mut request, &root), StatusCode::PayloadTooLarge);
    }

    #[test]
    fn content_type_follows_extension() {
        let (_dir, root) = root_with_file("style.css", b"body{}");
        let mut request = parsed("GET /style.css HTTP/1.1\r\n\r\n");
        assert_eq!(process_request(&mut request, &root), StatusCode::Ok);
        assert_eq!(request.content_type, "text/css");
    }

    #[test]
    fn keep_alive_decision() {
        let request = parsed("GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert_eq!(request.headers.connection, Some(false));

        let request = parsed("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(request.headers.connection, Some(true));
        assert_eq!(request.parser.version(), Some(Version::Http10));
    }
}
