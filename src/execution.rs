//! Executions and their frontier snapshots.
//!
//! An execution is a causally-closed set of events partitioned per
//! thread; a frontier names the last included event of each thread and
//! is the canonical cut representation used for rewinds. Both hold only
//! non-owning ids into the event arena and are cheap to copy.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::event::{EventId, Events};
use crate::indexed_map::IndexedMap;
use crate::sorted_list::SortedList;
use crate::thread::{construct_thread_id, ThreadId};
use crate::vector_clock::VectorClock;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Execution {
    threads: IndexedMap<SortedList>,
}

impl Execution {
    pub(crate) fn new() -> Self {
        Self {
            threads: IndexedMap::new(),
        }
    }

    /// Appends an event; its parent must be the last event of its thread.
    pub(crate) fn add(&mut self, events: &Events, id: EventId) {
        let ev = &events[id];
        let last = self.last_event(ev.thread);
        assert!(
            last == ev.parent,
            "cannot add {}: thread {} ends at {:?}, expected parent {:?}",
            events[id],
            ev.thread,
            last,
            ev.parent
        );
        self.threads
            .get_or_insert_with(usize::from(ev.thread), SortedList::new)
            .push(id);
    }

    /// Drops the events of thread `t` at positions `pos` and later.
    pub(crate) fn cut(&mut self, t: ThreadId, pos: u32) {
        if let Some(list) = self.threads.get_mut(usize::from(t)) {
            list.truncate(pos as usize);
        }
    }

    /// Cuts the thread of `id` right after it.
    pub(crate) fn cut_next(&mut self, events: &Events, id: EventId) {
        let ev = &events[id];
        self.cut(ev.thread, ev.thread_position + 1);
    }

    /// For each conflicting event, cuts its thread at the event's position.
    pub(crate) fn cut_conflicts(&mut self, events: &Events, conflicts: &[EventId]) {
        for &c in conflicts {
            let ev = &events[c];
            self.cut(ev.thread, ev.thread_position);
        }
    }

    /// Cuts off trailing blocking requests that have no response.
    ///
    /// `keep` survives the trim; a response being appended needs its own
    /// parent request to stay in place.
    pub(crate) fn cut_dangling_requests(&mut self, events: &Events, keep: Option<EventId>) {
        for list in self.threads.iter_mut() {
            while let Some(last) = list.last() {
                if Some(last) != keep && events[last].label.is_blocking() && events[last].label.is_request() {
                    list.pop();
                } else {
                    break;
                }
            }
        }
    }

    pub(crate) fn frontier(&self) -> ExecutionFrontier {
        let mut f = ExecutionFrontier::new();
        for (tid, list) in self.threads.enumerate() {
            if let Some(last) = list.last() {
                f.pin(construct_thread_id(tid as u32), last);
            }
        }
        f
    }

    pub(crate) fn last_event(&self, t: ThreadId) -> Option<EventId> {
        self.threads.get(usize::from(t)).and_then(|l| l.last())
    }

    pub(crate) fn first_event(&self, t: ThreadId) -> Option<EventId> {
        self.threads.get(usize::from(t)).and_then(|l| l.first())
    }

    pub(crate) fn at(&self, t: ThreadId, pos: u32) -> Option<EventId> {
        self.threads
            .get(usize::from(t))
            .and_then(|l| l.get(pos as usize))
    }

    pub(crate) fn contains(&self, events: &Events, id: EventId) -> bool {
        let ev = &events[id];
        self.threads
            .get(usize::from(ev.thread))
            .is_some_and(|l| l.contains(id))
    }

    pub(crate) fn thread_size(&self, t: ThreadId) -> usize {
        self.threads.get(usize::from(t)).map_or(0, |l| l.len())
    }

    pub(crate) fn thread_ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.threads
            .enumerate()
            .filter(|(_, l)| !l.is_empty())
            .map(|(tid, _)| construct_thread_id(tid as u32))
    }

    pub(crate) fn thread_events(&self, t: ThreadId) -> impl Iterator<Item = EventId> + '_ {
        self.threads
            .get(usize::from(t))
            .into_iter()
            .flat_map(|l| l.iter())
    }

    /// All events of the execution, in no particular order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = EventId> + '_ {
        self.threads.iter().flat_map(|l| l.iter())
    }

    /// All events of the execution in ascending id order, which always
    /// linearizes happens-before.
    pub(crate) fn iter_ordered(&self) -> Vec<EventId> {
        let mut ids: Vec<EventId> = self.iter().collect();
        ids.sort();
        ids
    }

    /// Thread-by-thread listing, used by verbose mode and test failures.
    pub(crate) fn print(&self, events: &Events) -> String {
        let mut out = String::new();
        for (tid, list) in self.threads.enumerate() {
            let _ = writeln!(out, "thread t{}:", tid);
            for id in list.iter() {
                let _ = writeln!(out, "\t{}", events[id]);
            }
        }
        out
    }
}

/// A per-thread "last included event" snapshot of an execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ExecutionFrontier {
    last: IndexedMap<EventId>,
}

impl ExecutionFrontier {
    pub(crate) fn new() -> Self {
        Self {
            last: IndexedMap::new(),
        }
    }

    pub(crate) fn get(&self, t: ThreadId) -> Option<EventId> {
        self.last.get(usize::from(t)).copied()
    }

    /// Unconditionally sets the frontier of `t`.
    pub(crate) fn pin(&mut self, t: ThreadId, id: EventId) {
        self.last.set(usize::from(t), id);
    }

    /// Whether the frontier includes the position of `id`.
    pub(crate) fn covers(&self, events: &Events, id: EventId) -> bool {
        let ev = &events[id];
        self.get(ev.thread)
            .is_some_and(|last| events[last].thread_position >= ev.thread_position)
    }

    /// Rewinds each thread below the position of its conflicting event.
    pub(crate) fn cut_conflicts(&mut self, events: &Events, conflicts: &[EventId]) {
        for &c in conflicts {
            let ev = &events[c];
            let ind = usize::from(ev.thread);
            while let Some(&last) = self.last.get(ind) {
                if events[last].thread_position < ev.thread_position {
                    break;
                }
                match events[last].parent {
                    Some(parent) => self.last.set(ind, parent),
                    None => {
                        self.last.remove(ind);
                        break;
                    }
                }
            }
        }
    }

    /// Rewinds trailing blocking requests, sparing `keep`.
    pub(crate) fn cut_dangling_requests(&mut self, events: &Events, keep: Option<EventId>) {
        let tids: Vec<usize> = self.last.enumerate().map(|(t, _)| t).collect();
        for ind in tids {
            while let Some(&last) = self.last.get(ind) {
                let label = &events[last].label;
                if Some(last) != keep && label.is_request() && label.is_blocking() {
                    match events[last].parent {
                        Some(parent) => self.last.set(ind, parent),
                        None => {
                            self.last.remove(ind);
                            break;
                        }
                    }
                } else {
                    break;
                }
            }
        }
    }

    /// Advances the frontier to cover a causality clock, resolving
    /// positions through the given execution.
    pub(crate) fn merge_clock(
        &mut self,
        events: &Events,
        execution: &Execution,
        clock: &VectorClock,
    ) {
        for (tid, pos) in clock.entries() {
            let behind = self
                .get(tid)
                .is_none_or(|last| events[last].thread_position < pos);
            if behind {
                let id = execution.at(tid, pos).unwrap_or_else(|| {
                    panic!("causal predecessor ({}, {}) is not in the execution", tid, pos)
                });
                self.pin(tid, id);
            }
        }
    }

    /// Materializes the causally-closed execution ending at this frontier
    /// by walking the per-thread parent chains.
    pub(crate) fn to_execution(&self, events: &Events) -> Execution {
        let mut execution = Execution::new();
        for (_, &last) in self.last.enumerate() {
            let mut chain = Vec::new();
            let mut cursor = Some(last);
            while let Some(id) = cursor {
                chain.push(id);
                cursor = events[id].parent;
            }
            for id in chain.into_iter().rev() {
                execution.add(events, id);
            }
        }
        execution
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (ThreadId, EventId)> + '_ {
        self.last
            .enumerate()
            .map(|(tid, &id)| (construct_thread_id(tid as u32), id))
    }
}
