//! Hybrid logical clock used to order events from the same node and to
//! break ties during conflict resolution.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub unix_millis: i64,
    pub lamport: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { unix_millis: 0, lamport: 0 };

    pub fn new(unix_millis: i64, lamport: i64) -> Self {
        Self { unix_millis, lamport }
    }

    /// Returns a timestamp strictly greater than `self`: local and remote
    /// advances both increment the Lamport counter.
    pub fn next(&self, now_ms: i64) -> Timestamp {
        Timestamp {
            unix_millis: now_ms.max(self.unix_millis),
            lamport: self.lamport + 1,
        }
    }

    pub fn max(self, other: Timestamp) -> Timestamp {
        if other > self {
            other
        } else {
            self
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lamport
            .cmp(&other.lamport)
            .then_with(|| self.unix_millis.cmp(&other.unix_millis))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_lamport_then_unix_millis() {
        let a = Timestamp::new(1000, 1);
        let b = Timestamp::new(1000, 2);
        assert!(b > a);

        let c = Timestamp::new(500, 3);
        let d = Timestamp::new(1000, 3);
        assert!(d > c, "equal lamport falls back to unix_millis");
    }

    #[test]
    fn next_is_strictly_greater_and_bumps_lamport() {
        let t = Timestamp::new(1000, 5);
        let n = t.next(900); // even if wall clock regressed
        assert!(n > t);
        assert_eq!(n.lamport, 6);
        assert_eq!(n.unix_millis, 1000);

        let n2 = t.next(2000);
        assert_eq!(n2.unix_millis, 2000);
    }

    #[test]
    fn repeated_next_is_monotone() {
        let mut t = Timestamp::ZERO;
        let mut prev = t;
        for _ in 0..100 {
            t = t.next(now_millis());
            assert!(t > prev);
            prev = t;
        }
    }

    #[test]
    fn max_picks_the_greater_timestamp() {
        let a = Timestamp::new(1000, 2);
        let b = Timestamp::new(1000, 1);
        assert_eq!(a.max(b), a);
        assert_eq!(b.max(a), a);
    }
}
