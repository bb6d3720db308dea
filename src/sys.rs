//! Thin wrappers around the raw system calls the server needs: the epoll
//! selector, the listening socket, and the byte-moving primitives.
//!
//! Every libc call in the crate goes through this module. Linux only.

use std::io;
use std::mem::{self, MaybeUninit};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::Token;

/// Helper macro to execute a system call that returns an `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// The value of a [`Connection`] file descriptor that is not attached to any
/// kernel object.
///
/// [`Connection`]: crate::Connection
pub const CLOSED: RawFd = -1;

/// A kernel readiness event, as returned by [`Selector::select`].
pub type Event = libc::epoll_event;

/// One epoll instance.
///
/// Registration is level-free: every fd is registered edge-triggered, with
/// peer-close detection on the read direction. The interest mask handed to
/// [`Selector::ctl`] is built with [`interests_to_epoll`] from the two
/// per-direction flags the caller tracks.
#[derive(Debug)]
pub struct Selector {
    ep: OwnedFd,
}

/// Which `epoll_ctl(2)` operation to perform.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CtlOp {
    Add,
    Mod,
    Del,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    /// Blocks until at least one event is ready or `timeout` milliseconds
    /// have elapsed, filling `events` with what the kernel reports.
    ///
    /// A `timeout` of `-1` blocks indefinitely. `EINTR` is surfaced as
    /// `io::ErrorKind::Interrupted`; the caller decides whether that means
    /// shutdown or retry.
    pub fn select(&self, events: &mut Vec<Event>, timeout: libc::c_int) -> io::Result<usize> {
        events.clear();
        let n_events = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout,
        ))?;
        // SAFETY: `epoll_wait` ensures that `n_events` are assigned.
        unsafe { events.set_len(n_events as usize) };
        Ok(n_events as usize)
    }

    pub fn ctl(&self, op: CtlOp, fd: RawFd, token: Token, interests: u32) -> io::Result<()> {
        let op = match op {
            CtlOp::Add => libc::EPOLL_CTL_ADD,
            CtlOp::Mod => libc::EPOLL_CTL_MOD,
            CtlOp::Del => {
                let ep = self.ep.as_raw_fd();
                return syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()))
                    .map(|_| ());
            }
        };
        let mut event = libc::epoll_event {
            events: interests,
            u64: usize::from(token) as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, op, fd, &mut event)).map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

pub fn interests_to_epoll(readable: bool, writable: bool) -> u32 {
    let mut kind = EPOLLET;

    if readable {
        kind = kind | EPOLLIN | EPOLLRDHUP;
    }

    if writable {
        kind |= EPOLLOUT;
    }

    kind as u32
}

pub mod event {
    use crate::sys::Event;
    use crate::Token;

    pub fn token(event: &Event) -> Token {
        Token(event.u64 as usize)
    }

    pub fn is_readable(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLIN) != 0
    }

    pub fn is_writable(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLOUT) != 0
    }

    /// Error or peer close. The dispatch loop turns this into synthetic
    /// readable + writable readiness so the regular handlers observe the
    /// condition through their next syscall.
    pub fn is_error_or_hup(event: &Event) -> bool {
        (event.events as libc::c_int & (super::EPOLLERR | super::EPOLLHUP | super::EPOLLRDHUP))
            != 0
    }
}

/// Creates the IPv4 listening socket: `SO_REUSEADDR`, bound to `port` on any
/// address, backlog 1024, non-blocking.
///
/// Port 0 asks the kernel for an ephemeral port; see [`local_port`].
pub fn tcp_listen(port: u16) -> io::Result<OwnedFd> {
    let fd = syscall!(socket(
        libc::AF_INET,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
    ))?;
    // SAFETY: `socket(2)` ensures the fd is valid.
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    let opt: libc::c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &opt as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();

    syscall!(bind(
        fd,
        &addr as *const libc::sockaddr_in as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
    ))?;
    syscall!(listen(fd, 1024))?;

    Ok(socket)
}

/// The port a listening socket is actually bound to.
pub fn local_port(fd: RawFd) -> io::Result<u16> {
    let mut addr: MaybeUninit<libc::sockaddr_in> = MaybeUninit::uninit();
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        addr.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
    ))?;
    // SAFETY: `getsockname(2)` initialised `len` bytes of `addr`.
    let addr = unsafe { addr.assume_init() };
    Ok(u16::from_be(addr.sin_port))
}

/// Accepts one pending connection, already non-blocking.
pub fn accept(listen_fd: RawFd) -> io::Result<RawFd> {
    syscall!(accept4(
        listen_fd,
        ptr::null_mut(),
        ptr::null_mut(),
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())).map(|n| n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize)
}

/// Zero-copy file-to-socket transfer, advancing the file's own offset.
pub fn sendfile(socket: RawFd, file: RawFd, count: usize) -> io::Result<usize> {
    syscall!(sendfile(socket, file, ptr::null_mut(), count)).map(|n| n as usize)
}

pub fn close(fd: RawFd) -> io::Result<()> {
    syscall!(close(fd)).map(|_| ())
}

/// `SIGPIPE` is delivered on writes to a reset connection; the write path
/// handles `EPIPE` instead.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
