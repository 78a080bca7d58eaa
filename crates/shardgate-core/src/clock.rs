use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Cluster time: wall-clock seconds plus an increment that orders events
/// within the same second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u32,
    pub inc: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, inc: 0 };

    pub fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// Packs into one integer, preserving order. Used as a sort key.
    pub fn as_u64(&self) -> u64 {
        ((self.secs as u64) << 32) | self.inc as u64
    }

    pub fn from_u64(v: u64) -> Self {
        Self {
            secs: (v >> 32) as u32,
            inc: v as u32,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// Hands out strictly increasing timestamps.
#[derive(Debug, Default)]
pub struct ClusterClock {
    last: Mutex<Timestamp>,
}

impl ClusterClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> Timestamp {
        let wall = wall_secs();
        let mut last = self.last.lock();
        let next = if wall > last.secs {
            Timestamp::new(wall, 1)
        } else {
            Timestamp::new(last.secs, last.inc + 1)
        };
        *last = next;
        next
    }

    /// Latest timestamp handed out, without advancing.
    pub fn peek(&self) -> Timestamp {
        *self.last.lock()
    }

    /// Never hand out anything at or below `ts` again.
    pub fn advance_to(&self, ts: Timestamp) {
        let mut last = self.last.lock();
        if ts > *last {
            *last = ts;
        }
    }
}

pub(crate) fn wall_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_strictly_increasing() {
        let clock = ClusterClock::new();
        let mut prev = clock.tick();
        for _ in 0..1000 {
            let next = clock.tick();
            assert!(next > prev);
            prev = next;
        }
        assert_eq!(clock.peek(), prev);
        assert_eq!(Timestamp::from_u64(prev.as_u64()), prev);
    }

    #[test]
    fn advance_to_moves_forward_only() {
        let clock = ClusterClock::new();
        let far = Timestamp::new(u32::MAX - 1, 5);
        clock.advance_to(far);
        assert!(clock.tick() > far);
        clock.advance_to(Timestamp::new(1, 1));
        assert!(clock.peek() > far);
    }
}
