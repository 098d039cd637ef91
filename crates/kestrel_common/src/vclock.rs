//! Vector clock: per-replica vector of highest applied log sequence numbers.
//!
//! The vclock is both the consistency cursor for replication and the
//! identity of a WAL segment (segments are named by the decimal signature
//! sum at creation time).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::{Lsn, ReplicaId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vclock {
    components: BTreeMap<u32, i64>,
}

impl Vclock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest applied lsn for a replica, 0 when the replica is unknown.
    pub fn get(&self, replica: ReplicaId) -> Lsn {
        Lsn(self.components.get(&replica.0).copied().unwrap_or(0))
    }

    /// Advance one component. Regression (lsn not strictly greater than the
    /// current value) is an error: rows must be applied in order.
    pub fn follow(&mut self, replica: ReplicaId, lsn: Lsn) -> Result<(), EngineError> {
        let current = self.get(replica);
        if lsn.0 <= current.0 {
            return Err(EngineError::VclockRegression {
                replica,
                from: current.0,
                to: lsn.0,
            });
        }
        self.components.insert(replica.0, lsn.0);
        Ok(())
    }

    /// Force-set one component without the ordering check. Used when
    /// adopting a vclock read from a segment header.
    pub fn reset(&mut self, replica: ReplicaId, lsn: Lsn) {
        if lsn.0 == 0 {
            self.components.remove(&replica.0);
        } else {
            self.components.insert(replica.0, lsn.0);
        }
    }

    /// Signature sum across all components. Segment files are named by it.
    pub fn sum(&self) -> i64 {
        self.components.values().sum()
    }

    /// Componentwise maximum of `self` and `other`.
    pub fn max_assign(&mut self, other: &Vclock) {
        for (&replica, &lsn) in &other.components {
            let entry = self.components.entry(replica).or_insert(0);
            if lsn > *entry {
                *entry = lsn;
            }
        }
    }

    /// Partial order: `None` when the two clocks are incomparable.
    pub fn partial_compare(&self, other: &Vclock) -> Option<Ordering> {
        let mut le = true;
        let mut ge = true;
        let replicas: std::collections::BTreeSet<u32> = self
            .components
            .keys()
            .chain(other.components.keys())
            .copied()
            .collect();
        for replica in replicas {
            let a = self.components.get(&replica).copied().unwrap_or(0);
            let b = other.components.get(&replica).copied().unwrap_or(0);
            if a < b {
                ge = false;
            }
            if a > b {
                le = false;
            }
        }
        match (le, ge) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, Lsn)> + '_ {
        self.components.iter().map(|(&r, &l)| (ReplicaId(r), Lsn(l)))
    }

    /// Parse the `Display` form: `{0: 5, 1: 12}`. Returns `None` on any
    /// syntax error; segment metadata parsing maps that to a codec error.
    pub fn parse(s: &str) -> Option<Vclock> {
        let body = s.trim().strip_prefix('{')?.strip_suffix('}')?;
        let mut clock = Vclock::new();
        for part in body.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (replica, lsn) = part.split_once(':')?;
            let replica: u32 = replica.trim().parse().ok()?;
            let lsn: i64 = lsn.trim().parse().ok()?;
            if lsn < 0 {
                return None;
            }
            clock.components.insert(replica, lsn);
        }
        Some(clock)
    }
}

impl fmt::Display for Vclock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (replica, lsn)) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", replica, lsn)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_advances_and_rejects_regression() {
        let mut v = Vclock::new();
        v.follow(ReplicaId(1), Lsn(1)).unwrap();
        v.follow(ReplicaId(1), Lsn(2)).unwrap();
        assert_eq!(v.get(ReplicaId(1)), Lsn(2));
        assert!(v.follow(ReplicaId(1), Lsn(2)).is_err());
        assert!(v.follow(ReplicaId(1), Lsn(1)).is_err());
    }

    #[test]
    fn sum_is_signature_sum() {
        let mut v = Vclock::new();
        v.follow(ReplicaId(1), Lsn(5)).unwrap();
        v.follow(ReplicaId(2), Lsn(7)).unwrap();
        assert_eq!(v.sum(), 12);
    }

    #[test]
    fn partial_order() {
        let mut a = Vclock::new();
        a.follow(ReplicaId(1), Lsn(5)).unwrap();
        let mut b = a.clone();
        b.follow(ReplicaId(2), Lsn(1)).unwrap();
        assert_eq!(a.partial_compare(&b), Some(Ordering::Less));
        assert_eq!(b.partial_compare(&a), Some(Ordering::Greater));
        assert_eq!(a.partial_compare(&a), Some(Ordering::Equal));

        let mut c = Vclock::new();
        c.follow(ReplicaId(2), Lsn(9)).unwrap();
        assert_eq!(a.partial_compare(&c), None);
    }

    #[test]
    fn display_parse_roundtrip() {
        let mut v = Vclock::new();
        v.follow(ReplicaId(0), Lsn(5)).unwrap();
        v.follow(ReplicaId(3), Lsn(42)).unwrap();
        let text = v.to_string();
        assert_eq!(text, "{0: 5, 3: 42}");
        assert_eq!(Vclock::parse(&text), Some(v));
        assert_eq!(Vclock::parse("{}"), Some(Vclock::new()));
        assert_eq!(Vclock::parse("{0 5}"), None);
    }

    #[test]
    fn max_assign_takes_componentwise_max() {
        let mut a = Vclock::new();
        a.follow(ReplicaId(1), Lsn(5)).unwrap();
        let mut b = Vclock::new();
        b.follow(ReplicaId(1), Lsn(3)).unwrap();
        b.follow(ReplicaId(2), Lsn(8)).unwrap();
        a.max_assign(&b);
        assert_eq!(a.get(ReplicaId(1)), Lsn(5));
        assert_eq!(a.get(ReplicaId(2)), Lsn(8));
    }
}
