//! Layer 0: Time primitives
//!
//! Lamport clock for causal ordering. WallClock for display (not ordering).

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::identity::SenderId;

/// Lamport timestamp - the ordering primitive within a stamp.
pub type Lamport = u64;

/// Wall clock epoch milliseconds - display only, never authoritative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallClock(pub u64);

impl WallClock {
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

/// Stamp = Lamport timestamp + attribution.
///
/// This is the `wins` total order: higher lamport first, ties broken by
/// sender. Two distinct records never carry the same stamp (a sender's
/// clock ticks on every append).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub lamport: Lamport,
    pub sender: SenderId,
}

impl Stamp {
    pub fn new(lamport: Lamport, sender: SenderId) -> Self {
        Self { lamport, sender }
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lamport
            .cmp(&other.lamport)
            .then_with(|| self.sender.cmp(&other.sender)) // deterministic tiebreak
    }
}

/// Per-replica Lamport clock.
///
/// `tick` stamps an outbound record; `observe` folds in a stamp seen on
/// delivery so later local appends dominate everything already applied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    last: Lamport,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self) -> Lamport {
        self.last += 1;
        self.last
    }

    pub fn observe(&mut self, seen: Lamport) {
        if seen > self.last {
            self.last = seen;
        }
    }

    pub fn last(&self) -> Lamport {
        self.last
    }
}
