use std::cmp;

use serde::{Deserialize, Serialize};

use crate::indexed_map::IndexedMap;
use crate::thread::{construct_thread_id, ThreadId};

/// A per-thread position vector.
///
/// Each entry names the maximum thread position observed for that thread.
/// An event's causality clock is such a vector, inclusive of the event
/// itself; `e` happens-before `f` iff `f`'s clock observes `e`'s
/// position.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct VectorClock {
    clock: IndexedMap<u32>,
}

impl VectorClock {
    pub(crate) fn new() -> Self {
        Self {
            clock: IndexedMap::new(),
        }
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (ThreadId, u32)> + '_ {
        self.clock
            .enumerate()
            .map(|(tid, &pos)| (construct_thread_id(tid as u32), pos))
    }

    pub(crate) fn get(&self, t: ThreadId) -> Option<u32> {
        self.clock.get(usize::from(t)).copied()
    }

    /// Returns true iff the view contains position `pos` of thread `t`.
    pub(crate) fn observes(&self, t: ThreadId, pos: u32) -> bool {
        self.get(t).is_some_and(|p| pos <= p)
    }

    /// Advance thread `t` to at least `pos`, populating the entry if missing.
    pub(crate) fn advance(&mut self, t: ThreadId, pos: u32) {
        let ind = usize::from(t);
        let new_val = cmp::max(self.clock.get(ind).copied().unwrap_or(0), pos);
        self.clock.set(ind, new_val);
    }

    /// Pointwise maximum with another clock.
    pub(crate) fn join(&mut self, other: &Self) {
        for (tid, &pos) in other.clock.enumerate() {
            self.advance(construct_thread_id(tid as u32), pos);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Entries of -1 mark threads absent from the clock.
    fn clock(value: &[i32]) -> VectorClock {
        let mut c = VectorClock::new();
        for (tid, &pos) in value.iter().enumerate() {
            if pos >= 0 {
                c.advance(construct_thread_id(tid as u32), pos as u32);
            }
        }
        c
    }

    #[test]
    fn observes_and_advance() {
        let mut v = clock(&[1, 0, 2]);
        assert!(v.observes(construct_thread_id(0), 1));
        assert!(!v.observes(construct_thread_id(0), 2));
        assert!(!v.observes(construct_thread_id(5), 0));

        v.advance(construct_thread_id(0), 3);
        v.advance(construct_thread_id(5), 5);
        assert_eq!(v, clock(&[3, 0, 2, -1, -1, 5]));

        // advance never moves an entry backwards
        v.advance(construct_thread_id(0), 1);
        assert_eq!(v.get(construct_thread_id(0)), Some(3));
    }

    #[test]
    fn join_is_pointwise_max() {
        let mut v1 = clock(&[1, -1, 2]);
        let v2 = clock(&[2, -1, 1, 5]);
        v1.join(&v2);
        assert_eq!(v1, clock(&[2, -1, 2, 5]));
    }

    #[test]
    fn clock_is_serializable() {
        let c = clock(&[1, 2, 3]);
        let str = serde_json::to_string(&c).unwrap();
        let c2: VectorClock = serde_json::from_str(&str).unwrap();
        assert_eq!(c, c2);
    }
}
