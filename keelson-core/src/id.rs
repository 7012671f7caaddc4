//! Channel identity.
//!
//! Every channel carries a process-unique id: a monotonic sequence number
//! plus a random nonce so ids from different processes are unlikely to
//! collide in logs. Equality is identity, ordering is a total order, and the
//! hash is derived from the id alone.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global sequence for channel ids within this process.
static NEXT_CHANNEL_SEQ: AtomicU64 = AtomicU64::new(1);

/// Unique, comparable channel identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId {
    seq: u64,
    nonce: u32,
}

impl ChannelId {
    /// Allocate the next process-unique id.
    #[must_use]
    pub fn next() -> Self {
        Self {
            seq: NEXT_CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed),
            nonce: rand::random(),
        }
    }

    /// Short text form: the random nonce as hex. Compact but not unique
    /// across the process lifetime; use for human-facing logs.
    #[must_use]
    pub fn as_short_text(&self) -> String {
        format!("{:08x}", self.nonce)
    }

    /// Long text form: nonce plus sequence, unique within the process.
    #[must_use]
    pub fn as_long_text(&self) -> String {
        format!("{:08x}-{:016x}", self.nonce, self.seq)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_short_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_distinct_and_ordered() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert_ne!(a, b);
        assert!(a < b, "later ids order after earlier ones");
    }

    #[test]
    fn test_total_order() {
        let mut ids: Vec<ChannelId> = (0..16).map(|_| ChannelId::next()).collect();
        let sorted = ids.clone();
        ids.reverse();
        ids.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_text_forms() {
        let id = ChannelId::next();
        assert_eq!(id.as_short_text().len(), 8);
        assert!(id.as_long_text().starts_with(&id.as_short_text()));
        assert_eq!(id.to_string(), id.as_short_text());
    }
}
