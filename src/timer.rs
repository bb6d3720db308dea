//! Deadline index for connection-level timeouts.
//!
//! An ordered map from absolute expiry time (monotonic milliseconds) to the
//! [`Token`] of the connection whose read event armed the deadline. A
//! sequence number disambiguates identical deadlines, so the map holds one
//! entry per armed event and the minimum key is always the next wake-up.

use std::collections::BTreeMap;

use crate::Token;

/// Monotonic milliseconds since the reactor started.
pub type TimeMs = u64;

/// Handle for one armed deadline; stored on the event that armed it and used
/// to cancel in `O(log n)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    deadline: TimeMs,
    seq: u64,
}

impl TimerKey {
    pub fn deadline(&self) -> TimeMs {
        self.deadline
    }
}

#[derive(Debug, Default)]
pub struct TimerIndex {
    entries: BTreeMap<TimerKey, Token>,
    next_seq: u64,
}

impl TimerIndex {
    pub fn new() -> TimerIndex {
        TimerIndex::default()
    }

    pub fn insert(&mut self, deadline: TimeMs, token: Token) -> TimerKey {
        let key = TimerKey {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, token);
        key
    }

    /// Cancels an armed deadline. Returns `false` when the key had already
    /// expired or been removed.
    pub fn remove(&mut self, key: TimerKey) -> bool {
        self.entries.remove(&key).is_some()
    }

    /// The earliest deadline, or `None` when nothing is armed.
    pub fn next_deadline(&self) -> Option<TimeMs> {
        self.entries.keys().next().map(|key| key.deadline)
    }

    /// Removes and returns the earliest entry whose deadline has passed.
    pub fn expire_next(&mut self, now: TimeMs) -> Option<(TimerKey, Token)> {
        let (&key, &token) = self.entries.iter().next()?;
        if key.deadline > now {
            return None;
        }
        self.entries.remove(&key);
        Some((key, token))
    }

    pub fn contains(&self, key: TimerKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_deadline() {
        let mut index = TimerIndex::new();
        index.insert(500, Token(1));
        index.insert(100, Token(2));
        index.insert(300, Token(3));
        assert_eq!(index.next_deadline(), Some(100));

        assert_eq!(index.expire_next(400).map(|(_, t)| t), Some(Token(2)));
        assert_eq!(index.expire_next(400).map(|(_, t)| t), Some(Token(3)));
        assert_eq!(index.expire_next(400), None);
        assert_eq!(index.next_deadline(), Some(500));
    }

    #[test]
    fn duplicate_deadlines_keep_distinct_entries() {
        let mut index = TimerIndex::new();
        let a = index.insert(100, Token(1));
        let b = index.insert(100, Token(2));
        assert_ne!(a, b);
        assert_eq!(index.len(), 2);

        assert!(index.remove(a));
        assert!(index.contains(b));
        assert_eq!(index.expire_next(100).map(|(_, t)| t), Some(Token(2)));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut index = TimerIndex::new();
        let key = index.insert(100, Token(1));
        assert!(index.remove(key));
        assert!(!index.remove(key));
        assert!(index.is_empty());
        assert_eq!(index.next_deadline(), None);
    }

    #[test]
    fn expiry_is_inclusive() {
        let mut index = TimerIndex::new();
        index.insert(100, Token(1));
        assert_eq!(index.expire_next(99), None);
        assert!(index.expire_next(100).is_some());
    }
}
