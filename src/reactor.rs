//! The event loop core: readiness demultiplexing plus the deadline index.
//!
//! A [`Reactor`] owns one epoll instance, the kernel event list, and the
//! [`TimerIndex`]. It knows nothing about HTTP; it moves connection records
//! in and out of the kernel registration, hands back per-tick readiness, and
//! expires deadlines against a "now" read once per tick so every handler in
//! a tick observes the same clock.

use std::io;
use std::time::Instant;

use crate::conn::{Connection, Direction, Pool};
use crate::sys::{self, CtlOp};
use crate::timer::{TimeMs, TimerIndex};
use crate::Token;

/// Readiness for one connection, copied out of the kernel event list.
#[derive(Copy, Clone, Debug)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error or peer close was reported; the dispatch loop synthesizes both
    /// directions so the handlers observe the condition via their syscalls.
    pub error: bool,
}

pub struct Reactor {
    selector: sys::Selector,
    events: Vec<sys::Event>,
    timers: TimerIndex,
    start: Instant,
    /// Updated once per [`poll`]; all timeout evaluation and re-arming in a
    /// tick uses this snapshot.
    ///
    /// [`poll`]: Reactor::poll
    now: TimeMs,
}

impl Reactor {
    pub fn new(max_events: usize) -> io::Result<Reactor> {
        Ok(Reactor {
            selector: sys::Selector::new()?,
            // epoll_wait refuses a zero-length event list.
            events: Vec::with_capacity(max_events.max(1)),
            timers: TimerIndex::new(),
            start: Instant::now(),
            now: 0,
        })
    }

    /// Milliseconds since the reactor was created, as of the last poll.
    pub fn now(&self) -> TimeMs {
        self.now
    }

    /// Registers a connection with read + write edge-triggered interest and
    /// peer-close detection. Both directions become active.
    pub fn register_rw(&self, conn: &mut Connection) -> io::Result<()> {
        debug_assert!(!conn.read.active && !conn.write.active);
        debug_assert!(!conn.is_closed());

        self.selector.ctl(
            CtlOp::Add,
            conn.fd(),
            conn.token(),
            sys::interests_to_epoll(true, true),
        )?;
        conn.read.active = true;
        conn.write.active = true;
        Ok(())
    }

    /// Adds one direction of interest for a connection.
    ///
    /// The kernel operation is ADD when the connection was not registered at
    /// all, MOD when the other direction is already present.
    pub fn enable(&self, conn: &mut Connection, dir: Direction) -> io::Result<()> {
        debug_assert!(!conn.event(dir).active);
        debug_assert!(!conn.is_closed());

        let (readable, writable, op) = match dir {
            Direction::Read => (true, conn.write.active, ctl_op(conn.write.active)),
            Direction::Write => (conn.read.active, true, ctl_op(conn.read.active)),
        };
        self.selector.ctl(
            op,
            conn.fd(),
            conn.token(),
            sys::interests_to_epoll(readable, writable),
        )?;
        match dir {
            Direction::Read => conn.read.active = true,
            Direction::Write => conn.write.active = true,
        }
        Ok(())
    }

    /// Removes one direction of interest.
    ///
    /// MOD while the other direction remains registered; DEL when the
    /// interest mask would become empty, which also detaches the record from
    /// its fd (the caller still holds the fd value for closing).
    pub fn disable(&self, conn: &mut Connection, dir: Direction) -> io::Result<()> {
        debug_assert!(conn.event(dir).active);
        debug_assert!(!conn.is_closed());

        let (readable, writable) = match dir {
            Direction::Read => (false, conn.write.active),
            Direction::Write => (conn.read.active, false),
        };
        if readable || writable {
            self.selector.ctl(
                CtlOp::Mod,
                conn.fd(),
                conn.token(),
                sys::interests_to_epoll(readable, writable),
            )?;
        } else {
            self.selector.ctl(CtlOp::Del, conn.fd(), conn.token(), 0)?;
            conn.clear_fd();
        }
        match dir {
            Direction::Read => conn.read.active = false,
            Direction::Write => conn.write.active = false,
        }
        Ok(())
    }

    /// Removes the connection from the demultiplexer entirely and marks its
    /// record detached.
    pub fn deregister(&self, conn: &mut Connection) -> io::Result<()> {
        debug_assert!(conn.read.active || conn.write.active);

        self.selector.ctl(CtlOp::Del, conn.fd(), conn.token(), 0)?;
        conn.clear_fd();
        conn.read.active = false;
        conn.write.active = false;
        Ok(())
    }

    /// Arms the read-side deadline `timeout_ms` from the tick's "now".
    pub fn timer_add(&mut self, conn: &mut Connection, timeout_ms: TimeMs) {
        debug_assert!(conn.read.timer_key.is_none());
        let key = self.timers.insert(self.now + timeout_ms, conn.token());
        conn.read.timer_key = Some(key);
    }

    /// Disarms the read-side deadline, if armed.
    pub fn timer_del(&mut self, conn: &mut Connection) {
        if let Some(key) = conn.read.timer_key.take() {
            self.timers.remove(key);
        }
    }

    /// Milliseconds until the earliest armed deadline, or `None` when the
    /// index is empty and the next poll may block indefinitely.
    pub fn timer_recent(&self) -> Option<TimeMs> {
        let now = self.start.elapsed().as_millis() as TimeMs;
        self.timers
            .next_deadline()
            .map(|deadline| deadline.saturating_sub(now))
    }

    /// Blocks up to `budget_ms` (`None` means forever) for readiness, then
    /// snapshots "now" for the tick. Returns the number of ready events.
    pub fn poll(&mut self, budget_ms: Option<TimeMs>) -> io::Result<usize> {
        let timeout = budget_ms.map_or(-1, |ms| ms.min(i32::MAX as TimeMs) as libc::c_int);
        let n = self.selector.select(&mut self.events, timeout)?;
        self.now = self.start.elapsed().as_millis() as TimeMs;
        Ok(n)
    }

    /// The `i`-th readiness of the current tick, `i < poll()`'s return.
    pub fn readiness(&self, i: usize) -> Readiness {
        let event = &self.events[i];
        Readiness {
            token: sys::event::token(event),
            readable: sys::event::is_readable(event),
            writable: sys::event::is_writable(event),
            error: sys::event::is_error_or_hup(event),
        }
    }

    /// Pops the next expired deadline, marking its read event fired
    /// (`timeout` set, timer disarmed) before handing the token back for
    /// dispatch. Expiry is evaluated against the tick's "now".
    pub fn expire(&mut self, pool: &mut Pool) -> Option<Token> {
        let (key, token) = self.timers.expire_next(self.now)?;
        let event = &mut pool[token].read;
        debug_assert_eq!(event.timer_key, Some(key));
        event.timer_key = None;
        event.timeout = true;
        Some(token)
    }

    #[cfg(test)]
    pub(crate) fn timer_len(&self) -> usize {
        self.timers.len()
    }
}

fn ctl_op(other_active: bool) -> CtlOp {
    if other_active {
        CtlOp::Mod
    } else {
        CtlOp::Add
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("timers", &self.timers)
            .field("now", &self.now)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::RawFd;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let res = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(res, 0);
        (fds[0], fds[1])
    }

    fn close_pair(pair: (RawFd, RawFd)) {
        let _ = sys::close(pair.0);
        let _ = sys::close(pair.1);
    }

    #[test]
    fn register_and_deregister() {
        let mut reactor = Reactor::new(8).unwrap();
        let mut pool = Pool::with_capacity(1);
        let pair = socketpair();

        let token = pool.get().unwrap();
        let conn = &mut pool[token];
        conn.set_fd(pair.0);
        reactor.register_rw(conn).unwrap();
        assert!(conn.read.active && conn.write.active);

        // Peer wrote; poll must report our token readable and writable.
        sys::write(pair.1, b"x").unwrap();
        let n = reactor.poll(Some(1000)).unwrap();
        assert_eq!(n, 1);
        let readiness = reactor.readiness(0);
        assert_eq!(readiness.token, token);
        assert!(readiness.readable);
        assert!(readiness.writable);

        let conn = &mut pool[token];
        reactor.deregister(conn).unwrap();
        assert!(conn.is_closed());
        assert!(!conn.read.active && !conn.write.active);

        pool.free(token);
        close_pair(pair);
    }

    #[test]
    fn direction_toggling() {
        let reactor = Reactor::new(8).unwrap();
        let mut pool = Pool::with_capacity(1);
        let pair = socketpair();

        let token = pool.get().unwrap();
        let conn = &mut pool[token];
        conn.set_fd(pair.0);

        // Empty -> read-only is an ADD.
        reactor.enable(conn, Direction::Read).unwrap();
        assert!(conn.read.active && !conn.write.active);

        // Read -> read+write is a MOD.
        reactor.enable(conn, Direction::Write).unwrap();
        assert!(conn.read.active && conn.write.active);

        // Dropping one direction keeps the registration alive.
        reactor.disable(conn, Direction::Read).unwrap();
        assert!(!conn.read.active && conn.write.active);
        assert!(!conn.is_closed());

        // Dropping the last direction is a DEL and detaches the record.
        reactor.disable(conn, Direction::Write).unwrap();
        assert!(conn.is_closed());

        pool.free(token);
        close_pair(pair);
    }

    #[test]
    fn peer_close_reports_error_readiness() {
        let mut reactor = Reactor::new(8).unwrap();
        let mut pool = Pool::with_capacity(1);
        let pair = socketpair();

        let token = pool.get().unwrap();
        let conn = &mut pool[token];
        conn.set_fd(pair.0);
        reactor.register_rw(conn).unwrap();

        sys::close(pair.1).unwrap();
        let n = reactor.poll(Some(1000)).unwrap();
        assert_eq!(n, 1);
        assert!(reactor.readiness(0).error);

        let conn = &mut pool[token];
        reactor.deregister(conn).unwrap();
        pool.free(token);
        let _ = sys::close(pair.0);
    }

    #[test]
    fn timer_arm_disarm_expire() {
        let mut reactor = Reactor::new(8).unwrap();
        let mut pool = Pool::with_capacity(2);
        let pair = socketpair();

        let token = pool.get().unwrap();
        let conn = &mut pool[token];
        conn.set_fd(pair.0);

        // Armed timer is indexed exactly once.
        reactor.timer_add(conn, 5);
        assert!(conn.read.timer_set());
        assert_eq!(reactor.timer_len(), 1);
        assert!(reactor.timer_recent().is_some());

        // Disarm removes the entry and clears the flag.
        reactor.timer_del(conn);
        assert!(!pool[token].read.timer_set());
        assert_eq!(reactor.timer_len(), 0);
        assert_eq!(reactor.timer_recent(), None);

        // Re-arm and let it fire: the poll advances "now" past the
        // deadline, expire pops the entry and marks the event.
        let conn = &mut pool[token];
        reactor.timer_add(conn, 5);
        std::thread::sleep(std::time::Duration::from_millis(10));
        reactor.poll(Some(20)).unwrap();
        let expired = reactor.expire(&mut pool);
        assert_eq!(expired, Some(token));
        assert!(pool[token].read.timeout);
        assert!(!pool[token].read.timer_set());
        assert_eq!(reactor.timer_len(), 0);
        assert_eq!(reactor.expire(&mut pool), None);

        let conn = &mut pool[token];
        conn.read.timeout = false;
        conn.clear_fd();
        pool.free(token);
        close_pair(pair);
    }
}

