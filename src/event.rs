//! Events of the structure and the arena that owns them.

use std::fmt;
use std::ops::Index;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::execution::ExecutionFrontier;
use crate::label::LabelEnum;
use crate::thread::ThreadId;
use crate::vector_clock::VectorClock;

/// Identifier of an event: its index in the append-only arena.
///
/// Ids are monotone over the lifetime of the structure and are the
/// global sort key; happens-before is a suborder of id order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EventId(u32);

impl EventId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        EventId(raw)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Events synchronized with: empty for sends, one entry for binary
/// responses, several for barrier responses.
pub(crate) type Dependencies = SmallVec<[EventId; 2]>;

/// An immutable record of one atomic program action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Event {
    pub(crate) id: EventId,
    pub(crate) thread: ThreadId,
    pub(crate) thread_position: u32,
    pub(crate) label: LabelEnum,
    /// Previous event of the same thread; `None` only for roots.
    pub(crate) parent: Option<EventId>,
    pub(crate) dependencies: Dependencies,
    /// Per-thread max positions of causal predecessors, inclusive of self.
    pub(crate) clock: VectorClock,
    /// The send that allocated the object this event touches.
    pub(crate) allocation: Option<EventId>,
    /// For writes that store a reference: the allocation of the referent.
    pub(crate) source: Option<EventId>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}): {}",
            self.id, self.thread, self.thread_position, self.label
        )
    }
}

/// An event plus the exploration bookkeeping attached to it.
///
/// The `visited` bit is the sole mutable field of the whole data model:
/// it is set when the event is chosen into the current execution or as
/// an exploration root. The snapshots freeze what the exploration
/// starting at this event must restore (`frontier_snapshot`) and must
/// not revisit (`pinned_frontier`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct BacktrackableEvent {
    pub(crate) event: Event,
    pub(crate) visited: bool,
    pub(crate) frontier_snapshot: ExecutionFrontier,
    pub(crate) pinned_frontier: ExecutionFrontier,
}

impl BacktrackableEvent {
    pub(crate) fn id(&self) -> EventId {
        self.event.id
    }
}

/// The append-only arena owning every event of the structure.
///
/// Executions and frontiers refer into it by id; truncation during
/// backtracking is the only way events are ever discarded.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct Events {
    arena: Vec<BacktrackableEvent>,
}

impl Events {
    pub(crate) fn new() -> Self {
        Self { arena: Vec::new() }
    }

    pub(crate) fn next_id(&self) -> EventId {
        EventId(self.arena.len() as u32)
    }

    pub(crate) fn push(&mut self, ev: BacktrackableEvent) -> EventId {
        let id = self.next_id();
        assert_eq!(ev.event.id, id, "event id must equal its arena slot");
        self.arena.push(ev);
        id
    }

    /// Drops every event with an id strictly greater than `id`.
    pub(crate) fn truncate_after(&mut self, id: EventId) {
        self.arena.truncate(id.index() + 1);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &BacktrackableEvent> {
        self.arena.iter()
    }

    pub(crate) fn backtrackable(&self, id: EventId) -> &BacktrackableEvent {
        &self.arena[id.index()]
    }

    pub(crate) fn backtrackable_mut(&mut self, id: EventId) -> &mut BacktrackableEvent {
        &mut self.arena[id.index()]
    }

    /// Happens-before, reflexively: `a ≤ b`.
    pub(crate) fn le(&self, a: EventId, b: EventId) -> bool {
        let a = &self[a];
        self[b].clock.observes(a.thread, a.thread_position)
    }

    /// Happens-before, strictly: `a < b`.
    pub(crate) fn lt(&self, a: EventId, b: EventId) -> bool {
        a != b && self.le(a, b)
    }
}

impl Index<EventId> for Events {
    type Output = Event;
    fn index(&self, id: EventId) -> &Event {
        &self.arena[id.index()].event
    }
}
