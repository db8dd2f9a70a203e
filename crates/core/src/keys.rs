//! Partition-level keys and ring ordering
//!
//! A partition is addressed by a decorated key: the partition key bytes
//! prefixed with its token. The ring order is (token, key). Range bounds and
//! the cache index need positions slightly before or after a key, plus the
//! ±∞ sentinels, which `RingBound` provides.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A partition key decorated with its token.
///
/// Ordering is by `(token, key)`, which is the ring order used by the cache
/// index and by partition ranges.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DecoratedKey {
    /// Position of the key on the ring.
    pub token: u64,
    /// Raw partition key bytes.
    pub key: Vec<u8>,
}

impl DecoratedKey {
    /// Creates a decorated key from a token and raw key bytes.
    pub fn new(token: u64, key: impl Into<Vec<u8>>) -> Self {
        DecoratedKey {
            token,
            key: key.into(),
        }
    }
}

/// Key of a cache index slot: a real partition key or the end sentinel.
///
/// The cache index always contains a dummy entry at `Max` so that successor
/// lookups never fail.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RingKey {
    /// A real partition position.
    Key(DecoratedKey),
    /// The +∞ sentinel, greater than every key.
    Max,
}

impl RingKey {
    /// The decorated key, unless this is the end sentinel.
    pub fn as_key(&self) -> Option<&DecoratedKey> {
        match self {
            RingKey::Key(k) => Some(k),
            RingKey::Max => None,
        }
    }
}

impl From<DecoratedKey> for RingKey {
    fn from(k: DecoratedKey) -> Self {
        RingKey::Key(k)
    }
}

/// A position on the ring between keys.
///
/// `Before(k)` sorts just before `k`, `After(k)` just after; bounds never
/// compare equal to a key. This is how half-open and inclusive ranges are
/// expressed without a separate inclusivity flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingBound {
    /// Before every key.
    Min,
    /// Just before the given key: an inclusive start or exclusive end.
    Before(DecoratedKey),
    /// Just after the given key: an exclusive start or inclusive end.
    After(DecoratedKey),
    /// After every key.
    Max,
}

impl RingBound {
    /// Three-way comparison of this bound against a key.
    ///
    /// Never returns `Equal`.
    pub fn cmp_key(&self, key: &DecoratedKey) -> Ordering {
        match self {
            RingBound::Min => Ordering::Less,
            RingBound::Max => Ordering::Greater,
            RingBound::Before(b) => match b.cmp(key) {
                Ordering::Equal => Ordering::Less,
                other => other,
            },
            RingBound::After(b) => match b.cmp(key) {
                Ordering::Equal => Ordering::Greater,
                other => other,
            },
        }
    }

    /// Three-way comparison against a ring-key. Every bound, including
    /// `Max`, sorts before the end sentinel, so a lower-bound seek with any
    /// bound lands at the sentinel at the latest.
    pub fn cmp_ring_key(&self, key: &RingKey) -> Ordering {
        match key {
            RingKey::Key(k) => self.cmp_key(k),
            RingKey::Max => Ordering::Less,
        }
    }

    /// Total order among bounds.
    pub fn cmp_bound(&self, other: &RingBound) -> Ordering {
        use RingBound::*;
        match (self, other) {
            (Min, Min) | (Max, Max) => Ordering::Equal,
            (Min, _) => Ordering::Less,
            (_, Min) => Ordering::Greater,
            (Max, _) => Ordering::Greater,
            (_, Max) => Ordering::Less,
            (Before(a), Before(b)) | (After(a), After(b)) => a.cmp(b),
            (Before(a), After(b)) => match a.cmp(b) {
                Ordering::Equal => Ordering::Less,
                o => o,
            },
            (After(a), Before(b)) => match a.cmp(b) {
                Ordering::Equal => Ordering::Greater,
                o => o,
            },
        }
    }
}

/// A half-open-by-construction range of partition keys: `[start, end)` in
/// bound space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Lower bound of the range.
    pub start: RingBound,
    /// Upper bound of the range.
    pub end: RingBound,
}

impl KeyRange {
    /// The full ring.
    pub fn full() -> Self {
        KeyRange {
            start: RingBound::Min,
            end: RingBound::Max,
        }
    }

    /// A range containing exactly one key.
    pub fn singular(key: DecoratedKey) -> Self {
        KeyRange {
            start: RingBound::Before(key.clone()),
            end: RingBound::After(key),
        }
    }

    /// The half-open range `[start, end)`.
    pub fn half_open(start: DecoratedKey, end: DecoratedKey) -> Self {
        KeyRange {
            start: RingBound::Before(start),
            end: RingBound::Before(end),
        }
    }

    /// Whether the range contains the given key.
    pub fn contains(&self, key: &DecoratedKey) -> bool {
        self.start.cmp_key(key) == Ordering::Less && self.end.cmp_key(key) == Ordering::Greater
    }

    /// Trims the front of the range to the given bound. Returns `None` if
    /// nothing remains.
    pub fn trim_front(&self, bound: RingBound) -> Option<KeyRange> {
        let start = if self.start.cmp_bound(&bound) == Ordering::Less {
            bound
        } else {
            self.start.clone()
        };
        if start.cmp_bound(&self.end) == Ordering::Less {
            Some(KeyRange {
                start,
                end: self.end.clone(),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(t: u64) -> DecoratedKey {
        DecoratedKey::new(t, t.to_be_bytes().to_vec())
    }

    #[test]
    fn bound_never_equals_key() {
        let key = k(5);
        assert_eq!(RingBound::Before(key.clone()).cmp_key(&key), Ordering::Less);
        assert_eq!(RingBound::After(key.clone()).cmp_key(&key), Ordering::Greater);
    }

    #[test]
    fn half_open_contains() {
        let r = KeyRange::half_open(k(2), k(4));
        assert!(!r.contains(&k(1)));
        assert!(r.contains(&k(2)));
        assert!(r.contains(&k(3)));
        assert!(!r.contains(&k(4)));
    }

    #[test]
    fn singular_contains_only_its_key() {
        let r = KeyRange::singular(k(7));
        assert!(r.contains(&k(7)));
        assert!(!r.contains(&k(6)));
        assert!(!r.contains(&k(8)));
    }

    #[test]
    fn trim_front_advances_start() {
        let r = KeyRange::full();
        let trimmed = r.trim_front(RingBound::After(k(3))).unwrap();
        assert!(!trimmed.contains(&k(3)));
        assert!(trimmed.contains(&k(4)));

        let r = KeyRange::half_open(k(2), k(4));
        assert!(r.trim_front(RingBound::Max).is_none());
    }

    #[test]
    fn bound_order() {
        let order = [
            RingBound::Min,
            RingBound::Before(k(1)),
            RingBound::After(k(1)),
            RingBound::Before(k(2)),
            RingBound::Max,
        ];
        for w in order.windows(2) {
            assert_eq!(w[0].cmp_bound(&w[1]), Ordering::Less);
        }
    }
}
