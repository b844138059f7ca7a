//! The append-only event structure and its synchronization machinery.
//!
//! The structure owns every event ever created, including the
//! alternative responses that later explorations start from. Appending
//! an event discovers its conflicts (events occupying the same position
//! slot or consuming the same witness), rejects hb-cycles, and snapshots
//! the frontier the event can be replayed from. Event creation is
//! memoized: re-running a prefix after backtracking reaches for the same
//! `(thread, parent, label, dependencies)` shapes and must find the
//! original events rather than mint duplicates, otherwise the
//! exploration would re-offer choices it has already exhausted.

use std::collections::BTreeMap;

use log::{debug, trace};
use smallvec::smallvec;

use crate::algebra::{MemoryModelAlgebra, SyncType, SynchronizationAlgebra};
use crate::event::{BacktrackableEvent, Dependencies, Event, EventId, Events};
use crate::execution::{Execution, ExecutionFrontier};
use crate::label::{Init, LabelEnum};
use crate::location::{AllocationMap, Loc};
use crate::thread::{init_thread_id, ThreadId};
use crate::vector_clock::VectorClock;

/// Blocked blocking-request events, mapped to the response that would
/// unblock them once one is discovered.
pub(crate) type DanglingRequests = BTreeMap<EventId, Option<EventId>>;

pub(crate) struct EventStructure {
    algebra: MemoryModelAlgebra,
    events: Events,
    execution: Execution,
    pinned: ExecutionFrontier,
    dangling: DanglingRequests,
    allocations: AllocationMap,
    root: EventId,
}

impl EventStructure {
    pub(crate) fn new(algebra: MemoryModelAlgebra, main_tid: ThreadId) -> Self {
        let mut events = Events::new();
        let init_tid = init_thread_id();
        let mut clock = VectorClock::new();
        clock.advance(init_tid, 0);
        let root = events.push(BacktrackableEvent {
            event: Event {
                id: events.next_id(),
                thread: init_tid,
                thread_position: 0,
                label: LabelEnum::Init(Init::new(main_tid)),
                parent: None,
                dependencies: Dependencies::new(),
                clock,
                allocation: None,
                source: None,
            },
            visited: true,
            frontier_snapshot: ExecutionFrontier::new(),
            pinned_frontier: ExecutionFrontier::new(),
        });
        let mut execution = Execution::new();
        execution.add(&events, root);
        Self {
            algebra,
            events,
            execution,
            pinned: ExecutionFrontier::new(),
            dangling: DanglingRequests::new(),
            allocations: AllocationMap::new(),
            root,
        }
    }

    pub(crate) fn root(&self) -> EventId {
        self.root
    }

    pub(crate) fn events(&self) -> &Events {
        &self.events
    }

    pub(crate) fn execution(&self) -> &Execution {
        &self.execution
    }

    // ---- append (§ event creation) ----

    /// Events of the structure occupying the position slot.
    fn same_position_conflicts(&self, t: ThreadId, position: u32) -> Vec<EventId> {
        self.events
            .iter()
            .filter(|b| b.event.thread == t && b.event.thread_position == position)
            .map(|b| b.id())
            .collect()
    }

    /// Responses that consume the same witness as the proposed one:
    /// two lock acquisitions cannot take the same release, and two
    /// waiters cannot take the same non-broadcast notification.
    fn witness_conflicts(&self, label: &LabelEnum, deps: &Dependencies) -> Vec<EventId> {
        let witness = match deps.first() {
            Some(&w) => w,
            None => return Vec::new(),
        };
        match label {
            LabelEnum::Lock(l) if label.is_response() && !label.is_reentry() => self
                .events
                .iter()
                .filter(|b| {
                    matches!(&b.event.label, LabelEnum::Lock(o)
                        if b.event.label.is_response()
                            && !b.event.label.is_reentry()
                            && o.mutex == l.mutex)
                        && b.event.dependencies.first() == Some(&witness)
                })
                .map(|b| b.id())
                .collect(),
            LabelEnum::Wait(w) if label.is_response() => {
                let broadcast = matches!(&self.events[witness].label,
                    LabelEnum::Notify(n) if n.broadcast);
                if broadcast {
                    return Vec::new();
                }
                self.events
                    .iter()
                    .filter(|b| {
                        matches!(&b.event.label, LabelEnum::Wait(o)
                            if b.event.label.is_response() && o.mutex == w.mutex)
                            && b.event.dependencies.first() == Some(&witness)
                    })
                    .map(|b| b.id())
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    fn conflicting_events(
        &self,
        t: ThreadId,
        position: u32,
        label: &LabelEnum,
        deps: &Dependencies,
    ) -> Vec<EventId> {
        let mut conflicts = self.same_position_conflicts(t, position);
        for c in self.witness_conflicts(label, deps) {
            if !conflicts.contains(&c) {
                conflicts.push(c);
            }
        }
        conflicts
    }

    /// The existing event with the same shape, if any.
    fn find_equivalent(
        &self,
        t: ThreadId,
        parent: Option<EventId>,
        label: &LabelEnum,
        deps: &Dependencies,
    ) -> Option<EventId> {
        self.events
            .iter()
            .find(|b| {
                b.event.thread == t
                    && b.event.parent == parent
                    && b.event.dependencies == *deps
                    && b.event.label == *label
            })
            .map(|b| b.id())
    }

    /// Appends a new event, or returns its existing equivalent.
    ///
    /// Returns `None` on a causality violation: a conflicting event that
    /// is a causal predecessor of the parent or of a dependency cannot be
    /// displaced without orphaning that dependency, so the proposed
    /// synchronization is skipped.
    fn create_event(
        &mut self,
        t: ThreadId,
        label: LabelEnum,
        parent: Option<EventId>,
        deps: Dependencies,
    ) -> Option<EventId> {
        if let Some(existing) = self.find_equivalent(t, parent, &label, &deps) {
            return Some(existing);
        }

        let position = parent.map_or(0, |p| self.events[p].thread_position + 1);
        let conflicts = self.conflicting_events(t, position, &label, &deps);

        let cyclic = conflicts.iter().any(|&c| {
            deps.iter().any(|&d| self.events.le(c, d))
                || parent.is_some_and(|p| self.events.le(c, p))
        });
        if cyclic {
            trace!("causality violation creating {} on {}", label, t);
            return None;
        }

        let mut clock = parent.map_or_else(VectorClock::new, |p| self.events[p].clock.clone());
        for &d in &deps {
            clock.join(&self.events[d].clock);
        }

        let mut snapshot = self.execution.frontier();
        snapshot.cut_conflicts(&self.events, &conflicts);
        snapshot.cut_dangling_requests(&self.events, parent);

        let mut pinned = self.pinned.clone();
        pinned.cut_conflicts(&self.events, &conflicts);
        pinned.merge_clock(&self.events, &self.execution, &clock);
        pinned.cut_dangling_requests(&self.events, parent);

        clock.advance(t, position);

        let allocation = label.object().and_then(|o| self.allocations.get(o));
        let source = label
            .value()
            .and_then(|v| v.as_object())
            .and_then(|o| self.allocations.get(o));

        let id = self.events.next_id();
        pinned.pin(t, id);
        self.events.push(BacktrackableEvent {
            event: Event {
                id,
                thread: t,
                thread_position: position,
                label,
                parent,
                dependencies: deps,
                clock,
                allocation,
                source,
            },
            visited: false,
            frontier_snapshot: snapshot,
            pinned_frontier: pinned,
        });
        trace!("created {}", self.events[id]);
        Some(id)
    }

    // ---- synchronization (§ candidates and responses) ----

    fn is_blocked_dangling_request(&self, id: EventId) -> bool {
        self.dangling.contains_key(&id)
    }

    /// The current-execution events the new event may synchronize with.
    ///
    /// A candidate must not causally succeed the event. Request
    /// candidates whose choice is pinned are fixed for this exploration
    /// and must not be offered alternatives, except that a blocked
    /// dangling request may always be unblocked. Send candidates are
    /// never pinned away: serving as a dependency does not change their
    /// own choice.
    fn synchronization_candidates(&self, id: EventId) -> Vec<EventId> {
        let ev = &self.events[id];
        let mut candidates: Vec<EventId> = self
            .execution
            .iter_ordered()
            .into_iter()
            .filter(|&c| {
                c != id
                    && !self.events.le(id, c)
                    && !(self.events[c].label.is_request()
                        && self.pinned.covers(&self.events, c)
                        && !self.is_blocked_dangling_request(c))
            })
            .collect();

        match &ev.label {
            LabelEnum::Read(r) if ev.label.is_request() => {
                let loc = r.loc;
                let stale = self.observed_writes(ev.thread, loc);
                let view = self.frontier_of_clock(&ev.clock);
                let racy = self.racy_writes(loc, &view);
                candidates.retain(|&c| {
                    !stale.iter().chain(racy.iter()).any(|&w| self.events.lt(c, w))
                });
            }
            LabelEnum::Lock(_) if ev.label.is_reentry() => {
                // A reentrant acquisition only re-witnesses the allocation.
                candidates.retain(|&c| Some(c) == ev.allocation);
            }
            LabelEnum::Unlock(_) if ev.label.is_reentry() => {
                // A reentrant release hands nothing over.
                candidates.clear();
            }
            LabelEnum::Wait(_) if ev.label.is_request() => {
                // Notifications do not persist: a waiter cannot consume a
                // notification that is already in its causal past.
                candidates.retain(|&c| {
                    !matches!(self.events[c].label, LabelEnum::Notify(_))
                        || !self.events.lt(c, id)
                });
            }
            _ => {}
        }
        candidates
    }

    /// The writes this thread has already observed on `loc`.
    fn observed_writes(&self, t: ThreadId, loc: Loc) -> Vec<EventId> {
        self.execution
            .thread_events(t)
            .filter(|&e| {
                let ev = &self.events[e];
                ev.label.is_response() && ev.label.loc() == Some(loc)
            })
            .filter_map(|e| self.events[e].dependencies.first().copied())
            .collect()
    }

    /// Resolves a causality clock into the frontier it denotes.
    fn frontier_of_clock(&self, clock: &VectorClock) -> ExecutionFrontier {
        let mut f = ExecutionFrontier::new();
        for (tid, pos) in clock.entries() {
            let id = self.execution.at(tid, pos).unwrap_or_else(|| {
                panic!("clock position ({}, {}) is not in the execution", tid, pos)
            });
            f.pin(tid, id);
        }
        f
    }

    /// Per-thread latest writes to `loc` at or before the frontier.
    pub(crate) fn memory_view(&self, loc: Loc, frontier: &ExecutionFrontier) -> Vec<EventId> {
        let mut view = Vec::new();
        for (tid, last) in frontier.entries() {
            let limit = self.events[last].thread_position;
            let latest = self
                .execution
                .thread_events(tid)
                .take_while(|&e| self.events[e].thread_position <= limit)
                .filter(|&e| {
                    matches!(self.events[e].label, LabelEnum::Write(_))
                        && self.events[e].label.loc() == Some(loc)
                })
                .last();
            if let Some(w) = latest {
                view.push(w);
            }
        }
        view
    }

    /// The pairwise hb-maximal writes of the memory view.
    pub(crate) fn racy_writes(&self, loc: Loc, frontier: &ExecutionFrontier) -> Vec<EventId> {
        let view = self.memory_view(loc, frontier);
        view.iter()
            .copied()
            .filter(|&w| !view.iter().any(|&other| self.events.lt(w, other)))
            .collect()
    }

    fn create_response(
        &mut self,
        request: EventId,
        mut deps: Dependencies,
        label: LabelEnum,
    ) -> Option<EventId> {
        deps.sort();
        let t = self.events[request].thread;
        self.create_event(t, label, Some(request), deps)
    }

    /// Synchronizes a freshly added request or send against the current
    /// execution, recording every response it gives rise to.
    fn add_synchronized_events(&mut self, id: EventId) -> Vec<EventId> {
        let label = self.events[id].label.clone();
        let candidates = self.synchronization_candidates(id);
        match self.algebra.sync_type(&label) {
            SyncType::Binary => self.synchronize_binary(id, &label, &candidates),
            SyncType::Barrier => self.synchronize_barrier(id, &label, &candidates),
            SyncType::None => Vec::new(),
        }
    }

    fn synchronize_binary(
        &mut self,
        id: EventId,
        label: &LabelEnum,
        candidates: &[EventId],
    ) -> Vec<EventId> {
        let mut responses = Vec::new();
        for &c in candidates {
            let other = self.events[c].label.clone();
            if let Some(response) = self.algebra.sync(label, &other) {
                let (request, dep) = if label.is_request() { (id, c) } else { (c, id) };
                if let Some(rid) = self.create_response(request, smallvec![dep], response) {
                    responses.push(rid);
                }
            }
        }
        // Deterministic order: responses sorted by their dependency's id.
        responses.sort_by_key(|&r| self.events[r].dependencies.first().copied());
        responses.dedup();
        responses
    }

    fn synchronize_barrier(
        &mut self,
        id: EventId,
        label: &LabelEnum,
        candidates: &[EventId],
    ) -> Vec<EventId> {
        // Only barrier-family labels participate in the fold; binary
        // requests keep their own candidate filtering.
        let requests: Vec<EventId> = if label.is_request() {
            vec![id]
        } else {
            candidates
                .iter()
                .copied()
                .filter(|&c| {
                    self.events[c].label.is_request()
                        && self.algebra.sync_type(&self.events[c].label) == SyncType::Barrier
                })
                .collect()
        };

        let mut responses = Vec::new();
        for request in requests {
            let mut acc = self.events[request].label.clone();
            let mut deps = Dependencies::new();
            let mut sends: Vec<EventId> = candidates
                .iter()
                .copied()
                .filter(|&c| {
                    self.events[c].label.is_send()
                        && self.algebra.sync_type(&self.events[c].label) == SyncType::Barrier
                })
                .collect();
            if label.is_send() {
                sends.push(id);
                sends.sort();
            }
            for send in sends {
                let other = self.events[send].label.clone();
                if let Some(next) = self.algebra.sync(&acc, &other) {
                    if next != acc {
                        acc = next;
                        deps.push(send);
                    }
                }
            }
            // A partial barrier stays a blocking label and is not added.
            if acc.is_response() && acc.is_unblocked() {
                if let Some(rid) = self.create_response(request, deps, acc) {
                    responses.push(rid);
                }
            }
        }
        responses
    }

    /// Whether choosing this response would contradict the current
    /// execution: its position slot is taken or its witness is consumed.
    fn conflicts_with_execution(&self, id: EventId) -> bool {
        let ev = &self.events[id];
        if let Some(existing) = self.execution.at(ev.thread, ev.thread_position) {
            if existing != id {
                return true;
            }
        }
        self.witness_conflicts(&ev.label, &ev.dependencies)
            .into_iter()
            .any(|c| c != id && self.execution.contains(&self.events, c))
    }

    fn add_to_execution(&mut self, id: EventId) {
        self.execution.add(&self.events, id);
        self.events.backtrackable_mut(id).visited = true;
    }

    // ---- public append operations ----

    pub(crate) fn add_send(&mut self, t: ThreadId, label: LabelEnum) -> EventId {
        assert!(label.is_send(), "add_send takes a Send label, got {}", label);
        let parent = self.execution.last_event(t);
        let id = self
            .create_event(t, label, parent, Dependencies::new())
            .expect("a send has no dependencies and cannot violate causality");
        self.add_to_execution(id);
        if let LabelEnum::Alloc(a) = &self.events[id].label {
            let object = a.object;
            self.allocations.insert(object, id);
        }
        let responses = self.add_synchronized_events(id);
        for r in responses {
            self.record_unblock(r);
        }
        id
    }

    pub(crate) fn add_request(&mut self, t: ThreadId, label: LabelEnum) -> EventId {
        assert!(
            label.is_request(),
            "add_request takes a Request label, got {}",
            label
        );
        let parent = self.execution.last_event(t);
        let id = self
            .create_event(t, label, parent, Dependencies::new())
            .expect("a request has no dependencies and cannot violate causality");
        self.add_to_execution(id);
        id
    }

    /// Synthesizes (or adopts) the response events of a request and
    /// commits one of them to the current execution.
    ///
    /// Returns the chosen response and every response now on offer; the
    /// unchosen ones stay in the structure as backtrack points. Returns
    /// `(None, ..)` when the request blocks.
    pub(crate) fn add_response_events(&mut self, req: EventId) -> (Option<EventId>, Vec<EventId>) {
        // A blocked dangling request may already have its unblocker. A
        // recorded response can have gone stale in the meantime (another
        // waiter consumed the same witness first): such a double-unblock
        // is a conflict and the request stays blocked.
        if let Some(&Some(response)) = self.dangling.get(&req) {
            if self.conflicts_with_execution(response) {
                self.dangling.insert(req, None);
            } else {
                self.dangling.remove(&req);
                self.add_to_execution(response);
                debug!("unblocked {} with {}", self.events[req], self.events[response]);
                return (Some(response), vec![response]);
            }
        }

        let responses = self.add_synchronized_events(req);
        if responses.is_empty() {
            if self.events[req].label.is_blocking() {
                self.dangling.insert(req, None);
                debug!("blocked {}", self.events[req]);
            }
            return (None, responses);
        }

        // The last response compatible with the execution is the choice;
        // the response list is ordered by dependency id, so this is
        // deterministic.
        let chosen = responses
            .iter()
            .rev()
            .copied()
            .find(|&r| !self.conflicts_with_execution(r));
        match chosen {
            Some(r) => {
                self.dangling.remove(&req);
                self.add_to_execution(r);
                (Some(r), responses)
            }
            None => {
                if self.events[req].label.is_blocking() {
                    self.dangling.insert(req, None);
                    debug!("blocked {} (all responses conflict)", self.events[req]);
                }
                (None, responses)
            }
        }
    }

    /// Records a freshly created response as the unblocker of its
    /// request, if the request is dangling without one.
    fn record_unblock(&mut self, response: EventId) {
        if !self.events[response].label.is_unblocked() {
            return;
        }
        let request = match self.events[response].parent {
            Some(p) => p,
            None => return,
        };
        if let Some(slot) = self.dangling.get_mut(&request) {
            if slot.is_none() {
                *slot = Some(response);
                debug!(
                    "recorded {} as unblocker of {}",
                    self.events[response], self.events[request]
                );
            }
        }
    }

    // ---- exploration support ----

    /// The highest-id unvisited backtrackable event.
    pub(crate) fn next_backtrack_event(&self) -> Option<EventId> {
        self.events
            .iter()
            .filter(|b| !b.visited)
            .map(|b| b.id())
            .last()
    }

    /// Rewinds the structure to the creation-time frontier of `root_ev`
    /// and re-enters it as the first event of the new exploration.
    pub(crate) fn begin_exploration_at(&mut self, root_ev: EventId) {
        self.events.truncate_after(root_ev);
        self.events.backtrackable_mut(root_ev).visited = true;
        let snapshot = self.events.backtrackable(root_ev).frontier_snapshot.clone();
        let pinned = self.events.backtrackable(root_ev).pinned_frontier.clone();
        self.execution = snapshot.to_execution(&self.events);
        self.execution.add(&self.events, root_ev);
        self.pinned = pinned;
        self.rebuild_ephemeral_state();
    }

    /// Recomputes the allocation index and the dangling map from the
    /// current execution; both are derived state.
    pub(crate) fn rebuild_ephemeral_state(&mut self) {
        self.allocations.clear();
        for id in self.execution.iter_ordered() {
            if let LabelEnum::Alloc(a) = &self.events[id].label {
                let object = a.object;
                self.allocations.insert(object, id);
            }
        }
        self.dangling.clear();
        let trailing: Vec<EventId> = self
            .execution
            .thread_ids()
            .filter_map(|t| self.execution.last_event(t))
            .filter(|&e| self.events[e].label.is_request() && self.events[e].label.is_blocking())
            .collect();
        for e in trailing {
            self.dangling.insert(e, None);
        }
    }

    /// Cuts the execution back to the replayed frontier.
    ///
    /// A response just past the frontier survives the cut when its
    /// request is played and its dependencies all are too: the next
    /// exploration needs it in place to detect double-unblock conflicts.
    pub(crate) fn abort_exploration(&mut self, played: &ExecutionFrontier) {
        let tids: Vec<ThreadId> = self.execution.thread_ids().collect();
        for t in tids {
            let played_len = match played.get(t) {
                Some(last) => self.events[last].thread_position + 1,
                None => 0,
            };
            let mut keep = played_len;
            if played_len > 0 {
                let last_played = self.execution.at(t, played_len - 1);
                let next = self.execution.at(t, played_len);
                if let (Some(req), Some(resp)) = (last_played, next) {
                    let req_blocks = self.events[req].label.is_request()
                        && self.events[req].label.is_blocking();
                    let deps_played = self.events[resp]
                        .dependencies
                        .iter()
                        .all(|&d| played.covers(&self.events, d));
                    if req_blocks && self.events[resp].parent == Some(req) && deps_played {
                        keep += 1;
                    }
                }
            }
            self.execution.cut(t, keep);
        }
        self.rebuild_ephemeral_state();
    }

    // ---- thread and blocking queries ----

    pub(crate) fn is_started_thread(&self, t: ThreadId) -> bool {
        self.execution.first_event(t).is_some()
    }

    pub(crate) fn is_finished_thread(&self, t: ThreadId) -> bool {
        self.execution
            .last_event(t)
            .is_some_and(|e| matches!(self.events[e].label, LabelEnum::TFinish(_)))
    }

    pub(crate) fn is_active(&self, t: ThreadId) -> bool {
        self.is_started_thread(t)
            && !self.is_finished_thread(t)
            && !self
                .execution
                .last_event(t)
                .is_some_and(|e| self.is_blocked_awaiting_request(e))
    }

    pub(crate) fn is_blocked_request(&self, e: EventId) -> bool {
        self.dangling.contains_key(&e)
    }

    pub(crate) fn is_blocked_awaiting_request(&self, e: EventId) -> bool {
        self.dangling.get(&e) == Some(&None)
    }

    pub(crate) fn get_blocked_request(&self, t: ThreadId) -> Option<EventId> {
        self.execution
            .last_event(t)
            .filter(|&e| self.is_blocked_request(e))
    }
}
