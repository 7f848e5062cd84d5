//! Logical cluster time and replication log positions.

use std::{fmt::Display, sync::Arc};

use iox_time::TimeProvider;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A logical cluster timestamp: wall-clock seconds plus an increment that orders events inside
/// the same second.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    secs: u32,
    inc: u32,
}

impl Timestamp {
    pub const MIN: Self = Self { secs: 0, inc: 0 };
    pub const MAX: Self = Self {
        secs: u32::MAX,
        inc: u32::MAX,
    };

    pub fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    pub fn secs(&self) -> u32 {
        self.secs
    }

    pub fn inc(&self) -> u32 {
        self.inc
    }

    pub fn is_null(&self) -> bool {
        *self == Self::MIN
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// Position of an entry in the replication log.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpTime {
    term: i64,
    timestamp: Timestamp,
}

impl OpTime {
    pub fn new(term: i64, timestamp: Timestamp) -> Self {
        Self { term, timestamp }
    }

    pub fn term(&self) -> i64 {
        self.term
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn is_null(&self) -> bool {
        self.timestamp.is_null()
    }
}

/// Source of strictly increasing cluster timestamps.
#[derive(Debug)]
pub struct ClusterClock {
    time_provider: Arc<dyn TimeProvider>,
    last: Mutex<Timestamp>,
}

impl ClusterClock {
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            time_provider,
            last: Mutex::new(Timestamp::MIN),
        }
    }

    /// Reserve the next timestamp. Never returns the same value twice and never goes backwards,
    /// even if the wall clock does.
    pub fn tick(&self) -> Timestamp {
        let wall_secs =
            u32::try_from(self.time_provider.now().timestamp().max(0)).unwrap_or(u32::MAX);
        let mut last = self.last.lock();
        let next = if wall_secs > last.secs {
            Timestamp::new(wall_secs, 1)
        } else {
            Timestamp::new(last.secs, last.inc.saturating_add(1))
        };
        *last = next;
        next
    }

    /// The most recently handed out (or observed) timestamp.
    pub fn now(&self) -> Timestamp {
        *self.last.lock()
    }

    /// Move the clock forward to a timestamp observed elsewhere in the cluster.
    pub fn advance_to(&self, observed: Timestamp) {
        let mut last = self.last.lock();
        if observed > *last {
            *last = observed;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use iox_time::{MockProvider, Time};

    use super::*;

    #[test]
    fn tick_is_strictly_increasing() {
        let tp = Arc::new(MockProvider::new(Time::from_timestamp(100, 0).unwrap()));
        let clock = ClusterClock::new(Arc::clone(&tp) as _);
        let a = clock.tick();
        let b = clock.tick();
        assert_eq!(Timestamp::new(100, 1), a);
        assert_eq!(Timestamp::new(100, 2), b);

        tp.inc(Duration::from_secs(1));
        assert_eq!(Timestamp::new(101, 1), clock.tick());

        // wall clock going backwards does not move the cluster clock backwards
        tp.set(Time::from_timestamp(50, 0).unwrap());
        assert_eq!(Timestamp::new(101, 2), clock.tick());
    }

    #[test]
    fn advance_to_only_moves_forward() {
        let tp = Arc::new(MockProvider::new(Time::from_timestamp(10, 0).unwrap()));
        let clock = ClusterClock::new(tp);
        clock.advance_to(Timestamp::new(20, 5));
        assert_eq!(Timestamp::new(20, 5), clock.now());
        clock.advance_to(Timestamp::new(15, 0));
        assert_eq!(Timestamp::new(20, 5), clock.now());
        assert_eq!(Timestamp::new(20, 6), clock.tick());
    }

    #[test]
    fn op_time_orders_by_term_first() {
        let early_term = OpTime::new(1, Timestamp::new(500, 0));
        let late_term = OpTime::new(2, Timestamp::new(10, 0));
        assert!(early_term < late_term);
    }
}
