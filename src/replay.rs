//! Deterministic replay of a scripted execution prefix.
//!
//! When an exploration starts from a backtrack point, the restored
//! execution must be re-driven through the instrumented runtime in a
//! fixed order before fresh events may be appended. The script is the
//! execution order declared by the consistency checker, which always
//! linearizes happens-before, so every event's dependencies are played
//! before the event itself.

use serde::{Deserialize, Serialize};

use crate::event::{EventId, Events};
use crate::thread::ThreadId;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct Replayer {
    script: Vec<EventId>,
    position: usize,
}

impl Replayer {
    pub(crate) fn new(script: Vec<EventId>) -> Self {
        Self {
            script,
            position: 0,
        }
    }

    pub(crate) fn done() -> Self {
        Self::default()
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.position < self.script.len()
    }

    pub(crate) fn next_event(&self) -> Option<EventId> {
        self.script.get(self.position).copied()
    }

    pub(crate) fn advance(&mut self) {
        self.position += 1;
    }

    /// Whether thread `t` owns the next scripted event.
    pub(crate) fn can_replay_next_event(&self, events: &Events, t: ThreadId) -> bool {
        self.next_event()
            .is_some_and(|e| events[e].thread == t)
    }
}
