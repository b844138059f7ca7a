//! Incremental consistency checkers.
//!
//! A checker summarizes the current execution and answers, event by
//! event, whether the execution is still feasible under the configured
//! memory model. Checkers are composed by short-circuit aggregation in a
//! fixed order; the first one to report an inconsistency wins and the
//! exploration is pruned.

use std::collections::{HashMap, HashSet};

use crate::error::Inconsistency;
use crate::event::{EventId, Events};
use crate::execution::Execution;
use crate::label::LabelEnum;
use crate::location::Loc;
use crate::thread::ThreadId;

pub(crate) trait ConsistencyChecker {
    /// Recomputes the summary from scratch against a new execution.
    fn reset(&mut self, events: &Events, execution: &Execution);

    /// Incrementally accounts for one appended event.
    fn check_event(
        &mut self,
        events: &Events,
        execution: &Execution,
        id: EventId,
    ) -> Option<Inconsistency>;

    /// Checks the whole current execution.
    fn check(&mut self, events: &Events, execution: &Execution) -> Option<Inconsistency>;

    /// The execution order this checker vouches for, if it declares one.
    fn execution_order(&self) -> Option<Vec<EventId>> {
        None
    }
}

/// The reads-from write of a response: its first dependency. For reads
/// this is the observed write (or the initializing event).
fn reads_from(events: &Events, response: EventId) -> Option<EventId> {
    events[response].dependencies.first().copied()
}

fn is_read_response(events: &Events, id: EventId) -> bool {
    matches!(events[id].label, LabelEnum::Read(_)) && events[id].label.is_response()
}

fn is_write(events: &Events, id: EventId) -> bool {
    matches!(events[id].label, LabelEnum::Write(_))
}

// ---------------------------------------------------------------------
// Atomicity
// ---------------------------------------------------------------------

/// Checks that read-modify-write pairs are atomic: no two RMWs observe
/// the same write, and no foreign write to the location is hb-ordered
/// between a read-exclusive and its paired write-exclusive.
#[derive(Default)]
pub(crate) struct AtomicityChecker {
    /// Exclusive read responses keyed by the write they observe.
    rmw_readers: HashMap<EventId, EventId>,
}

impl AtomicityChecker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn check_exclusive_read(
        &mut self,
        events: &Events,
        id: EventId,
    ) -> Option<Inconsistency> {
        let rf = reads_from(events, id)?;
        if let Some(&other) = self.rmw_readers.get(&rf) {
            if other != id {
                return Some(Inconsistency::Atomicity {
                    first: other,
                    second: id,
                });
            }
        }
        self.rmw_readers.insert(rf, id);
        None
    }

    /// The exclusive read response this exclusive write is paired with.
    fn paired_read(
        &self,
        events: &Events,
        execution: &Execution,
        write: EventId,
    ) -> Option<EventId> {
        let loc = events[write].label.loc()?;
        execution
            .thread_events(events[write].thread)
            .take_while(|&e| e != write)
            .filter(|&e| {
                is_read_response(events, e)
                    && events[e].label.is_exclusive()
                    && events[e].label.loc() == Some(loc)
            })
            .last()
    }

    fn check_exclusive_write(
        &mut self,
        events: &Events,
        execution: &Execution,
        write: EventId,
    ) -> Option<Inconsistency> {
        let loc = events[write].label.loc()?;
        let read = self.paired_read(events, execution, write)?;
        let rf = reads_from(events, read)?;
        let interposed = execution.iter().find(|&w| {
            w != write
                && w != rf
                && is_write(events, w)
                && events[w].label.loc() == Some(loc)
                && events.lt(rf, w)
                && events.lt(w, write)
        });
        interposed.map(|w| Inconsistency::Atomicity {
            first: w,
            second: write,
        })
    }
}

impl ConsistencyChecker for AtomicityChecker {
    fn reset(&mut self, events: &Events, execution: &Execution) {
        self.rmw_readers.clear();
        for id in execution.iter_ordered() {
            if is_read_response(events, id) && events[id].label.is_exclusive() {
                if let Some(rf) = reads_from(events, id) {
                    self.rmw_readers.insert(rf, id);
                }
            }
        }
    }

    fn check_event(
        &mut self,
        events: &Events,
        execution: &Execution,
        id: EventId,
    ) -> Option<Inconsistency> {
        if !events[id].label.is_exclusive() {
            return None;
        }
        if is_read_response(events, id) {
            return self.check_exclusive_read(events, id);
        }
        if is_write(events, id) {
            return self.check_exclusive_write(events, execution, id);
        }
        None
    }

    fn check(&mut self, events: &Events, execution: &Execution) -> Option<Inconsistency> {
        self.reset(events, execution);
        for id in execution.iter_ordered() {
            if let Some(inc) = self.check_event(events, execution, id) {
                return Some(inc);
            }
        }
        None
    }
}

// ---------------------------------------------------------------------
// Sequential consistency / release-acquire
// ---------------------------------------------------------------------

/// Checks that the execution can be linearized into a total execution
/// order extending hb and compatible with reads-from.
///
/// The release-acquire part is incremental: every reads-from edge is a
/// synchronizes-with edge, so a read must never observe a write that is
/// hb-overwritten. The sequential part is a search for a witness order,
/// memoized on (per-thread progress, last write per location); it runs
/// in the full `check()` only.
pub(crate) struct SequentialConsistencyChecker {
    release_acquire: bool,
    sequential: bool,
    witness: Option<Vec<EventId>>,
}

impl SequentialConsistencyChecker {
    pub(crate) fn new(release_acquire: bool, sequential: bool) -> Self {
        Self {
            release_acquire,
            sequential,
            witness: None,
        }
    }

    /// A read must observe a write that is not stale under hb: no other
    /// write to the location may lie strictly between the observed write
    /// and the read.
    fn check_coherence(
        &self,
        events: &Events,
        execution: &Execution,
        read: EventId,
    ) -> Option<Inconsistency> {
        let loc = events[read].label.loc()?;
        let rf = reads_from(events, read)?;
        let overwrite = execution.iter().find(|&w| {
            w != rf
                && is_write(events, w)
                && events[w].label.loc() == Some(loc)
                && events.lt(rf, w)
                && events.lt(w, read)
        });
        overwrite.map(|w| Inconsistency::ReleaseAcquire {
            read,
            write: rf,
            overwrite: w,
        })
    }

    fn linearize(&self, events: &Events, execution: &Execution) -> Option<Vec<EventId>> {
        let tids: Vec<ThreadId> = execution.thread_ids().collect();
        let lists: Vec<Vec<EventId>> = tids
            .iter()
            .map(|&t| execution.thread_events(t).collect())
            .collect();
        let total: usize = lists.iter().map(|l| l.len()).sum();
        let mut search = LinearizationSearch {
            events,
            tids: &tids,
            lists: &lists,
            positions: vec![0; lists.len()],
            last_write: HashMap::new(),
            order: Vec::with_capacity(total),
            failed: HashSet::new(),
        };
        if search.run(total) {
            Some(search.order)
        } else {
            None
        }
    }
}

impl ConsistencyChecker for SequentialConsistencyChecker {
    fn reset(&mut self, _events: &Events, _execution: &Execution) {
        self.witness = None;
    }

    fn check_event(
        &mut self,
        events: &Events,
        execution: &Execution,
        id: EventId,
    ) -> Option<Inconsistency> {
        self.witness = None;
        if self.release_acquire && is_read_response(events, id) {
            return self.check_coherence(events, execution, id);
        }
        None
    }

    fn check(&mut self, events: &Events, execution: &Execution) -> Option<Inconsistency> {
        if self.release_acquire {
            for id in execution.iter_ordered() {
                if is_read_response(events, id) {
                    if let Some(inc) = self.check_coherence(events, execution, id) {
                        return Some(inc);
                    }
                }
            }
        }
        if self.sequential {
            match self.linearize(events, execution) {
                Some(order) => self.witness = Some(order),
                None => return Some(Inconsistency::SequentialConsistency),
            }
        }
        None
    }

    fn execution_order(&self) -> Option<Vec<EventId>> {
        self.witness.clone()
    }
}

struct LinearizationSearch<'a> {
    events: &'a Events,
    tids: &'a [ThreadId],
    lists: &'a [Vec<EventId>],
    positions: Vec<usize>,
    last_write: HashMap<Loc, EventId>,
    order: Vec<EventId>,
    /// Search states already shown infeasible.
    failed: HashSet<(Vec<usize>, Vec<(Loc, EventId)>)>,
}

impl LinearizationSearch<'_> {
    fn thread_index(&self, t: ThreadId) -> usize {
        self.tids.iter().position(|&o| o == t).unwrap()
    }

    fn scheduled(&self, e: EventId) -> bool {
        let ev = &self.events[e];
        (ev.thread_position as usize) < self.positions[self.thread_index(ev.thread)]
    }

    fn schedulable(&self, e: EventId) -> bool {
        if !self.events[e].dependencies.iter().all(|&d| self.scheduled(d)) {
            return false;
        }
        if is_read_response(self.events, e) {
            let loc = self.events[e].label.loc().unwrap();
            let rf = self.events[e].dependencies.first().copied();
            let last = self.last_write.get(&loc).copied();
            return match rf {
                Some(rf) if is_write(self.events, rf) => last == Some(rf),
                // Reading the initializing event: no write scheduled yet.
                _ => last.is_none(),
            };
        }
        true
    }

    fn state_key(&self) -> (Vec<usize>, Vec<(Loc, EventId)>) {
        let mut writes: Vec<(Loc, EventId)> =
            self.last_write.iter().map(|(&l, &w)| (l, w)).collect();
        writes.sort();
        (self.positions.clone(), writes)
    }

    fn run(&mut self, total: usize) -> bool {
        if self.order.len() == total {
            return true;
        }
        if !self.failed.insert(self.state_key()) {
            return false;
        }
        for i in 0..self.lists.len() {
            let e = match self.lists[i].get(self.positions[i]) {
                Some(&e) => e,
                None => continue,
            };
            if !self.schedulable(e) {
                continue;
            }
            self.positions[i] += 1;
            self.order.push(e);
            let saved = if is_write(self.events, e) {
                let loc = self.events[e].label.loc().unwrap();
                Some((loc, self.last_write.insert(loc, e)))
            } else {
                None
            };
            if self.run(total) {
                return true;
            }
            if let Some((loc, prev)) = saved {
                match prev {
                    Some(w) => {
                        self.last_write.insert(loc, w);
                    }
                    None => {
                        self.last_write.remove(&loc);
                    }
                }
            }
            self.order.pop();
            self.positions[i] -= 1;
        }
        false
    }
}

// ---------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------

pub(crate) struct AggregateChecker {
    checkers: Vec<Box<dyn ConsistencyChecker>>,
}

impl AggregateChecker {
    pub(crate) fn new(checkers: Vec<Box<dyn ConsistencyChecker>>) -> Self {
        Self { checkers }
    }
}

impl ConsistencyChecker for AggregateChecker {
    fn reset(&mut self, events: &Events, execution: &Execution) {
        for c in &mut self.checkers {
            c.reset(events, execution);
        }
    }

    fn check_event(
        &mut self,
        events: &Events,
        execution: &Execution,
        id: EventId,
    ) -> Option<Inconsistency> {
        self.checkers
            .iter_mut()
            .find_map(|c| c.check_event(events, execution, id))
    }

    fn check(&mut self, events: &Events, execution: &Execution) -> Option<Inconsistency> {
        self.checkers
            .iter_mut()
            .find_map(|c| c.check(events, execution))
    }

    fn execution_order(&self) -> Option<Vec<EventId>> {
        self.checkers.iter().find_map(|c| c.execution_order())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::{BacktrackableEvent, Event};
    use crate::execution::ExecutionFrontier;
    use crate::label::{Alloc, LabelEnum, Read, Write};
    use crate::location::{ObjectId, Val};
    use crate::thread::construct_thread_id;
    use crate::vector_clock::VectorClock;

    fn push_event(
        events: &mut Events,
        t: u32,
        label: LabelEnum,
        parent: Option<EventId>,
        deps: &[EventId],
    ) -> EventId {
        let tid = construct_thread_id(t);
        let pos = parent.map_or(0, |p| events[p].thread_position + 1);
        let mut clock = parent.map_or_else(VectorClock::new, |p| events[p].clock.clone());
        for &d in deps {
            clock.join(&events[d].clock);
        }
        clock.advance(tid, pos);
        let id = events.next_id();
        events.push(BacktrackableEvent {
            event: Event {
                id,
                thread: tid,
                thread_position: pos,
                label,
                parent,
                dependencies: deps.iter().copied().collect(),
                clock,
                allocation: None,
                source: None,
            },
            visited: true,
            frontier_snapshot: ExecutionFrontier::new(),
            pinned_frontier: ExecutionFrontier::new(),
        })
    }

    fn write(loc: Loc, v: u64, exclusive: bool) -> LabelEnum {
        LabelEnum::Write(Write::new(loc, Val::int(v), exclusive))
    }

    fn read(loc: Loc, v: u64, exclusive: bool) -> LabelEnum {
        LabelEnum::Read(Read::response(loc, Val::int(v), exclusive))
    }

    /// The store-buffering (0, 0) outcome admits no linearization; the
    /// (1, 0) outcome does, and the witness extends hb.
    #[test]
    fn sequential_consistency_rejects_store_buffering_zero_zero() {
        let x = Loc::global(0);
        let y = Loc::global(1);
        let mut events = Events::new();
        let init = push_event(
            &mut events,
            0,
            LabelEnum::Alloc(Alloc::new(ObjectId::new(9))),
            None,
            &[],
        );
        let w1 = push_event(&mut events, 1, write(x, 1, false), None, &[]);
        let r1 = push_event(&mut events, 1, read(y, 0, false), Some(w1), &[init]);
        let w2 = push_event(&mut events, 2, write(y, 1, false), None, &[]);
        let r2 = push_event(&mut events, 2, read(x, 0, false), Some(w2), &[init]);

        let mut execution = Execution::new();
        for id in [init, w1, r1, w2, r2] {
            execution.add(&events, id);
        }
        let mut checker = SequentialConsistencyChecker::new(true, true);
        assert_eq!(
            checker.check(&events, &execution),
            Some(Inconsistency::SequentialConsistency)
        );

        // Let the second thread observe the first: now a witness exists.
        let mut events = Events::new();
        let init = push_event(
            &mut events,
            0,
            LabelEnum::Alloc(Alloc::new(ObjectId::new(9))),
            None,
            &[],
        );
        let w1 = push_event(&mut events, 1, write(x, 1, false), None, &[]);
        let r1 = push_event(&mut events, 1, read(y, 0, false), Some(w1), &[init]);
        let w2 = push_event(&mut events, 2, write(y, 1, false), None, &[]);
        let r2 = push_event(&mut events, 2, read(x, 1, false), Some(w2), &[w1]);

        let mut execution = Execution::new();
        for id in [init, w1, r1, w2, r2] {
            execution.add(&events, id);
        }
        assert_eq!(checker.check(&events, &execution), None);
        let order = checker.execution_order().unwrap();
        assert_eq!(order.len(), 5);
        let at = |e: EventId| order.iter().position(|&o| o == e).unwrap();
        assert!(at(w1) < at(r2), "the witness must schedule rf before the read");
        assert!(at(r1) < at(w2), "reading the initial value precedes the write");
    }

    /// A read must not observe a write that hb-later writes overwrite.
    #[test]
    fn release_acquire_rejects_overwritten_reads() {
        let x = Loc::global(0);
        let mut events = Events::new();
        let w1 = push_event(&mut events, 1, write(x, 1, false), None, &[]);
        let w2 = push_event(&mut events, 1, write(x, 2, false), Some(w1), &[]);
        let r = push_event(&mut events, 1, read(x, 1, false), Some(w2), &[w1]);

        let mut execution = Execution::new();
        for id in [w1, w2, r] {
            execution.add(&events, id);
        }
        let mut checker = SequentialConsistencyChecker::new(true, false);
        assert_eq!(
            checker.check_event(&events, &execution, r),
            Some(Inconsistency::ReleaseAcquire {
                read: r,
                write: w1,
                overwrite: w2,
            })
        );
    }

    /// Two read-modify-writes must not observe the same write.
    #[test]
    fn atomicity_rejects_lost_updates() {
        let x = Loc::global(0);
        let mut events = Events::new();
        let w = push_event(&mut events, 0, write(x, 0, false), None, &[]);
        let r1 = push_event(&mut events, 1, read(x, 0, true), None, &[w]);
        let r2 = push_event(&mut events, 2, read(x, 0, true), None, &[w]);

        let mut execution = Execution::new();
        for id in [w, r1] {
            execution.add(&events, id);
        }
        let mut checker = AtomicityChecker::new();
        checker.reset(&events, &execution);
        execution.add(&events, r2);
        assert_eq!(
            checker.check_event(&events, &execution, r2),
            Some(Inconsistency::Atomicity {
                first: r1,
                second: r2,
            })
        );
    }

    /// A foreign write hb-between a read-exclusive and its paired
    /// write-exclusive breaks the RMW.
    #[test]
    fn atomicity_rejects_interposed_writes() {
        let x = Loc::global(0);
        let mut events = Events::new();
        let w0 = push_event(&mut events, 1, write(x, 0, false), None, &[]);
        let r = push_event(&mut events, 1, read(x, 0, true), Some(w0), &[w0]);
        let interposed = push_event(&mut events, 2, write(x, 7, false), None, &[r]);
        let w = push_event(&mut events, 1, write(x, 1, true), Some(r), &[interposed]);

        let mut execution = Execution::new();
        for id in [w0, r, interposed, w] {
            execution.add(&events, id);
        }
        let mut checker = AtomicityChecker::new();
        checker.reset(&events, &execution);
        assert_eq!(
            checker.check_event(&events, &execution, w),
            Some(Inconsistency::Atomicity {
                first: interposed,
                second: w,
            })
        );
    }
}
