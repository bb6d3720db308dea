//! Fixed-capacity FIFO byte window, used for the inbound and outbound header
//! buffers of a request.

use std::fmt;
use std::io;

/// A `[0, capacity)` region with a read cursor and a write cursor.
///
/// Bytes are appended at the write cursor ([`fill`] after a syscall wrote
/// into [`writable`], or [`write`] for an in-process copy) and consumed from
/// the read cursor ([`consume`]). Cursors only move forward; the buffer never
/// reallocates and never compacts, so absolute offsets recorded while
/// parsing ([`read_pos`]) stay valid for the buffer's whole lifetime.
///
/// Running out of space is not an internal error: the HTTP engine observes
/// [`is_full`] and turns it into the appropriate oversize status.
///
/// [`fill`]: Buffer::fill
/// [`writable`]: Buffer::writable
/// [`write`]: Buffer::write
/// [`consume`]: Buffer::consume
/// [`read_pos`]: Buffer::read_pos
/// [`is_full`]: Buffer::is_full
pub struct Buffer {
    data: Box<[u8]>,
    /// Read cursor; everything before it has been consumed.
    data_start: usize,
    /// Write cursor; everything from here to the end is free space.
    data_end: usize,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0; capacity].into_boxed_slice(),
            data_start: 0,
            data_end: 0,
        }
    }

    /// Bytes available to read.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.data_start..self.data_end]
    }

    /// Free space available to write into; pair with [`fill`].
    ///
    /// [`fill`]: Buffer::fill
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.data[self.data_end..]
    }

    /// Advances the read cursor by `n`.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.data_start += n;
    }

    /// Advances the write cursor by `n`, claiming bytes previously exposed
    /// through [`writable`].
    ///
    /// [`writable`]: Buffer::writable
    pub fn fill(&mut self, n: usize) {
        debug_assert!(self.data_end + n <= self.data.len());
        self.data_end += n;
    }

    /// Bulk-appends `src`, failing if it does not fit in the free space.
    pub fn write(&mut self, src: &[u8]) -> io::Result<()> {
        if src.len() > self.data.len() - self.data_end {
            return Err(io::ErrorKind::WriteZero.into());
        }
        self.data[self.data_end..self.data_end + src.len()].copy_from_slice(src);
        self.data_end += src.len();
        Ok(())
    }

    /// The next readable byte, without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.readable().first().copied()
    }

    /// Absolute offset of the read cursor, for recording spans.
    pub fn read_pos(&self) -> usize {
        self.data_start
    }

    /// Bytes at an absolute offset range, consumed or not.
    pub fn bytes(&self, range: std::ops::Range<usize>) -> &[u8] {
        &self.data[range]
    }

    pub fn is_empty(&self) -> bool {
        self.data_start == self.data_end
    }

    pub fn is_full(&self) -> bool {
        self.data_end == self.data.len()
    }

    /// Bytes available to read.
    pub fn len(&self) -> usize {
        self.data_end - self.data_start
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.data.len())
            .field("data_start", &self.data_start)
            .field("data_end", &self.data_end)
            .finish()
    }
}
