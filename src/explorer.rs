//! The exploration driver.
//!
//! One `Explorer` owns the event structure, the checkers, and the
//! replayer, and is the single façade the instrumented runtime calls
//! into. Control flow per exploration: pick an unvisited backtrackable
//! event, rewind to its creation-time frontier, replay the restored
//! prefix deterministically, then let the runtime append fresh events,
//! consulting the consistency checker as they arrive. An inconsistent
//! execution is pruned and the next backtrack point is taken.

use std::collections::BTreeSet;

use log::{debug, info, warn};

use crate::algebra::{MemoryInitializer, MemoryModelAlgebra};
use crate::cons::{
    AggregateChecker, AtomicityChecker, ConsistencyChecker, SequentialConsistencyChecker,
};
use crate::error::{Inconsistency, ModelError};
use crate::event::EventId;
use crate::event_structure::EventStructure;
use crate::execution::ExecutionFrontier;
use crate::label::{
    Alloc, LabelEnum, Lock, Notify, Park, Read, TFinish, TFork, TJoin, TStart, Unlock, Unpark,
    Wait, Write,
};
use crate::location::{Loc, ObjectId, Val};
use crate::thread::{init_thread_id, ThreadId};
use crate::replay::Replayer;
use crate::{Config, MemoryModel, Stats};

/// Callback the core invokes when the runtime must pick another thread
/// during replay; the argument is the thread that owns the next
/// scripted event.
pub type ThreadSwitchCallback = Box<dyn FnMut(ThreadId)>;

pub struct Explorer {
    config: Config,
    structure: EventStructure,
    checker: AggregateChecker,
    replayer: Replayer,
    played: ExecutionFrontier,
    exploration_root: Option<EventId>,
    detected_inconsistency: Option<Inconsistency>,
    /// Events accepted after an inconsistency was recorded; their checks
    /// are skipped and the buffer is dropped at the next exploration.
    delayed_checks: Vec<EventId>,
    thread_switch: Option<ThreadSwitchCallback>,
    exploration_live: bool,
    warned_thread_size: bool,
    stats: Stats,
}

impl Explorer {
    pub fn new(config: Config, memory_initializer: MemoryInitializer) -> Self {
        let algebra = MemoryModelAlgebra::new(memory_initializer);
        let sequential = config.memory_model == MemoryModel::SequentialConsistency;
        let checker = AggregateChecker::new(vec![
            Box::new(AtomicityChecker::new()),
            Box::new(SequentialConsistencyChecker::new(true, sequential)),
        ]);
        Self {
            structure: EventStructure::new(algebra, crate::thread::main_thread_id()),
            checker,
            replayer: Replayer::done(),
            played: ExecutionFrontier::new(),
            exploration_root: None,
            detected_inconsistency: None,
            delayed_checks: Vec::new(),
            thread_switch: None,
            exploration_live: false,
            warned_thread_size: false,
            stats: Stats::default(),
            config,
        }
    }

    pub fn set_internal_thread_switch_callback(&mut self, cb: ThreadSwitchCallback) {
        self.thread_switch = Some(cb);
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The inconsistency recorded for the current exploration, if any.
    pub fn detected_inconsistency(&self) -> Option<&Inconsistency> {
        self.detected_inconsistency.as_ref()
    }

    /// The backtrackable event the current exploration started at, or
    /// `None` during the initial exploration.
    pub fn current_exploration_root(&self) -> Option<EventId> {
        self.exploration_root
    }

    pub fn print_execution(&self) -> String {
        self.structure.execution().print(self.structure.events())
    }

    // ---- exploration lifecycle ----

    /// Primes the very first exploration: the played frontier holds the
    /// init-thread root and the replayer is already past it.
    pub fn initialize_exploration(&mut self) {
        let root = self.structure.root();
        self.played = ExecutionFrontier::new();
        self.played.pin(init_thread_id(), root);
        let mut replayer = Replayer::new(vec![root]);
        replayer.advance();
        self.replayer = replayer;
        self.checker
            .reset(self.structure.events(), self.structure.execution());
        self.detected_inconsistency = None;
        self.delayed_checks.clear();
        self.exploration_live = true;
    }

    /// Moves on to the next unexplored backtrack point.
    ///
    /// Returns `false` once every backtrackable event has been visited
    /// (or the configured exploration bound is reached).
    pub fn start_next_exploration(&mut self) -> bool {
        self.record_exploration_outcome();
        if let Some(max) = self.config.max_explorations {
            let total = self.stats.executions + self.stats.blocked + self.stats.inconsistent;
            if total as u64 >= max {
                info!("stopping: max_explorations reached");
                return false;
            }
        }
        loop {
            let root = match self.structure.next_backtrack_event() {
                Some(root) => root,
                None => return false,
            };
            debug!("starting exploration at {}", self.structure.events()[root]);
            self.structure.begin_exploration_at(root);
            self.exploration_root = Some(root);
            self.detected_inconsistency = None;
            self.delayed_checks.clear();

            let (events, execution) = (self.structure.events(), self.structure.execution());
            self.checker.reset(events, execution);
            let inconsistency = self
                .checker
                .check_event(events, execution, root)
                .or_else(|| self.checker.check(events, execution));
            if let Some(inc) = inconsistency {
                info!("pruned exploration at {}: {}", root, inc);
                self.stats.inconsistent += 1;
                continue;
            }

            // Replay in the checker's declared order, with the root
            // event normalized to the front so the init thread never
            // needs a runtime thread of its own.
            let structure_root = self.structure.root();
            let mut script = self
                .checker
                .execution_order()
                .unwrap_or_else(|| self.structure.execution().iter_ordered());
            script.retain(|&e| e != structure_root);
            script.insert(0, structure_root);
            let script = self.normalize_script(script);
            let mut replayer = Replayer::new(script);
            replayer.advance();
            self.replayer = replayer;
            self.played = ExecutionFrontier::new();
            self.played.pin(init_thread_id(), structure_root);
            self.exploration_live = true;
            return true;
        }
    }

    /// Cuts the current exploration back to what was actually replayed.
    pub fn abort_exploration(&mut self) {
        debug!("aborting exploration");
        self.structure.abort_exploration(&self.played);
        self.replayer = Replayer::done();
        self.checker
            .reset(self.structure.events(), self.structure.execution());
    }

    /// Checks the whole current execution, recording the verdict.
    ///
    /// Once an inconsistency is recorded it is idempotent for the rest
    /// of the exploration and further checks are suppressed.
    pub fn check_consistency(&mut self) -> Option<Inconsistency> {
        if self.detected_inconsistency.is_none() {
            self.detected_inconsistency = self
                .checker
                .check(self.structure.events(), self.structure.execution());
            if let Some(inc) = &self.detected_inconsistency {
                info!("inconsistent execution: {}", inc);
            }
        }
        self.detected_inconsistency.clone()
    }

    fn record_exploration_outcome(&mut self) {
        if !self.exploration_live {
            return;
        }
        self.exploration_live = false;
        if self.detected_inconsistency.is_some() {
            self.stats.inconsistent += 1;
            if self.config.verbose >= 2 {
                println!("One more inconsistent execution");
                println!("{}", self.print_execution());
            }
            return;
        }
        let init = init_thread_id();
        let all_finished = self
            .structure
            .execution()
            .thread_ids()
            .filter(|&t| t != init)
            .all(|t| self.structure.is_finished_thread(t));
        if all_finished {
            self.stats.executions += 1;
            if self.config.verbose >= 1 {
                println!("One more complete execution");
                println!("{}", self.print_execution());
            }
        } else {
            self.stats.blocked += 1;
            if self.config.verbose >= 2 {
                println!("One more blocked execution");
                println!("{}", self.print_execution());
            }
        }
    }

    // ---- replay plumbing ----

    /// Places every request immediately before its response.
    ///
    /// A request has no dependencies, so delaying it until just before
    /// its response never breaks the script's hb-compatibility; the
    /// runtime can then drive a whole operation (request plus response)
    /// as one step without another thread's event scripted in between.
    fn normalize_script(&self, script: Vec<EventId>) -> Vec<EventId> {
        let events = self.structure.events();
        let mut out = Vec::with_capacity(script.len());
        for &e in &script {
            if events[e].label.is_request() {
                let responded = script
                    .iter()
                    .any(|&r| events[r].parent == Some(e) && events[r].label.is_response());
                if responded {
                    continue;
                }
            }
            if events[e].label.is_response() {
                if let Some(req) = events[e].parent {
                    if events[req].label.is_request() && script.contains(&req) {
                        out.push(req);
                    }
                }
            }
            out.push(e);
        }
        out
    }

    fn in_replay_phase(&self) -> bool {
        self.replayer.in_progress()
    }

    /// Whether the current exploration is still replaying its scripted
    /// prefix.
    pub fn is_replaying(&self) -> bool {
        self.in_replay_phase()
    }

    /// Whether thread `t` owns the next scripted event.
    pub fn can_replay_next_event(&self, t: ThreadId) -> bool {
        self.replayer
            .can_replay_next_event(self.structure.events(), t)
    }

    fn replay_append(&mut self, t: ThreadId, label: &LabelEnum) -> Result<EventId, ModelError> {
        let next = self
            .replayer
            .next_event()
            .expect("replay_append requires an in-progress replayer");
        let expected = &self.structure.events()[next];
        if expected.thread != t {
            let owner = expected.thread;
            if let Some(cb) = &mut self.thread_switch {
                cb(owner);
            }
            return Err(ModelError::ReplayDesync {
                thread: t,
                reason: format!("out of turn, the next scripted event belongs to {}", owner),
            });
        }
        expected
            .label
            .compare_for_replay(label)
            .map_err(|reason| ModelError::ReplayDesync { thread: t, reason })?;
        debug!("replayed {}", self.structure.events()[next]);
        self.replayer.advance();
        self.played.pin(t, next);
        Ok(next)
    }

    fn check_appended(&mut self, id: EventId) {
        if self.detected_inconsistency.is_some() {
            self.delayed_checks.push(id);
            return;
        }
        let (events, execution) = (self.structure.events(), self.structure.execution());
        if let Some(inc) = self.checker.check_event(events, execution, id) {
            info!("inconsistent after {}: {}", events[id], inc);
            self.detected_inconsistency = Some(inc);
        }
    }

    fn warn_thread_size(&mut self, t: ThreadId) {
        let size = self.structure.execution().thread_size(t);
        if size > self.config.thread_threshold as usize && !self.warned_thread_size {
            self.warned_thread_size = true;
            warn!("thread {} has {} events, is the test bounded?", t, size);
        }
    }

    // ---- generic append operations ----

    pub(crate) fn add_send(
        &mut self,
        t: ThreadId,
        label: LabelEnum,
    ) -> Result<EventId, ModelError> {
        if self.in_replay_phase() {
            return self.replay_append(t, &label);
        }
        self.warn_thread_size(t);
        let id = self.structure.add_send(t, label);
        self.check_appended(id);
        Ok(id)
    }

    pub(crate) fn add_request(
        &mut self,
        t: ThreadId,
        label: LabelEnum,
    ) -> Result<EventId, ModelError> {
        if self.in_replay_phase() {
            return self.replay_append(t, &label);
        }
        self.warn_thread_size(t);
        let id = self.structure.add_request(t, label);
        self.check_appended(id);
        Ok(id)
    }

    /// Synthesizes or adopts the responses of a request; commits one.
    ///
    /// Returns `(None, ..)` when the request stays blocked: during
    /// replay, until the scripted response's dependencies are played;
    /// afterwards, until a matching send appears.
    pub fn add_response_events(
        &mut self,
        req: EventId,
    ) -> Result<(Option<EventId>, Vec<EventId>), ModelError> {
        if self.in_replay_phase() {
            let next = self
                .replayer
                .next_event()
                .expect("in-progress replayer has a next event");
            let events = self.structure.events();
            let adoptable = events[next].parent == Some(req)
                && events[next].label.is_response()
                && events[next]
                    .dependencies
                    .iter()
                    .all(|&d| self.played.covers(events, d));
            if adoptable {
                let t = events[next].thread;
                debug!("adopted scripted response {}", events[next]);
                self.replayer.advance();
                self.played.pin(t, next);
                return Ok((Some(next), vec![next]));
            }
            let owner = events[next].thread;
            if let Some(cb) = &mut self.thread_switch {
                cb(owner);
            }
            return Ok((None, Vec::new()));
        }
        let (chosen, all) = self.structure.add_response_events(req);
        if let Some(c) = chosen {
            self.check_appended(c);
        }
        Ok((chosen, all))
    }

    // ---- convenience wrappers ----

    pub fn add_object_allocation(
        &mut self,
        t: ThreadId,
        object: ObjectId,
    ) -> Result<EventId, ModelError> {
        self.add_send(t, LabelEnum::Alloc(Alloc::new(object)))
    }

    /// Appends a read request and immediately resolves it. Reads never
    /// block: the initializing event is always observable.
    pub fn add_read_event(
        &mut self,
        t: ThreadId,
        loc: Loc,
        exclusive: bool,
    ) -> Result<Option<Val>, ModelError> {
        let req = self.add_request(t, LabelEnum::Read(Read::request(loc, exclusive)))?;
        let (chosen, _) = self.add_response_events(req)?;
        Ok(chosen.and_then(|c| self.structure.events()[c].label.value()))
    }

    pub fn add_write_event(
        &mut self,
        t: ThreadId,
        loc: Loc,
        value: Val,
        exclusive: bool,
    ) -> Result<EventId, ModelError> {
        self.add_send(t, LabelEnum::Write(Write::new(loc, value, exclusive)))
    }

    pub fn add_lock_request(
        &mut self,
        t: ThreadId,
        mutex: ObjectId,
        depth: u32,
        is_wait_lock: bool,
    ) -> Result<EventId, ModelError> {
        self.add_request(t, LabelEnum::Lock(Lock::request(mutex, depth, is_wait_lock)))
    }

    pub fn add_lock_response(&mut self, req: EventId) -> Result<Option<EventId>, ModelError> {
        Ok(self.add_response_events(req)?.0)
    }

    pub fn add_unlock(
        &mut self,
        t: ThreadId,
        mutex: ObjectId,
        depth: u32,
        is_wait_unlock: bool,
    ) -> Result<EventId, ModelError> {
        self.add_send(t, LabelEnum::Unlock(Unlock::new(mutex, depth, is_wait_unlock)))
    }

    pub fn add_wait_request(
        &mut self,
        t: ThreadId,
        mutex: ObjectId,
    ) -> Result<EventId, ModelError> {
        self.add_request(t, LabelEnum::Wait(Wait::request(mutex)))
    }

    pub fn add_wait_response(&mut self, req: EventId) -> Result<Option<EventId>, ModelError> {
        Ok(self.add_response_events(req)?.0)
    }

    pub fn add_notify(
        &mut self,
        t: ThreadId,
        mutex: ObjectId,
        broadcast: bool,
    ) -> Result<EventId, ModelError> {
        self.add_send(t, LabelEnum::Notify(Notify::new(mutex, broadcast)))
    }

    pub fn add_park_request(&mut self, t: ThreadId) -> Result<EventId, ModelError> {
        self.add_request(t, LabelEnum::Park(Park::request(t)))
    }

    pub fn add_park_response(&mut self, req: EventId) -> Result<Option<EventId>, ModelError> {
        Ok(self.add_response_events(req)?.0)
    }

    pub fn add_unpark(&mut self, t: ThreadId, target: ThreadId) -> Result<EventId, ModelError> {
        self.add_send(t, LabelEnum::Unpark(Unpark::new(target)))
    }

    /// Appends the start request of a freshly running thread and resolves
    /// it against the fork (or the root, for the main thread).
    pub fn add_thread_start(&mut self, t: ThreadId) -> Result<Option<EventId>, ModelError> {
        let req = self.add_request(t, LabelEnum::TStart(TStart::request(t)))?;
        Ok(self.add_response_events(req)?.0)
    }

    pub fn add_thread_finish(&mut self, t: ThreadId) -> Result<EventId, ModelError> {
        self.add_send(t, LabelEnum::TFinish(TFinish::new(t)))
    }

    pub fn add_thread_fork(
        &mut self,
        t: ThreadId,
        tids: BTreeSet<ThreadId>,
    ) -> Result<EventId, ModelError> {
        self.add_send(t, LabelEnum::TFork(TFork::new(tids)))
    }

    /// Appends a join request; returns it and, when every joined thread
    /// has already finished, the immediate response.
    pub fn add_thread_join(
        &mut self,
        t: ThreadId,
        tids: BTreeSet<ThreadId>,
    ) -> Result<(EventId, Option<EventId>), ModelError> {
        let req = self.add_request(t, LabelEnum::TJoin(TJoin::request(tids)))?;
        let (chosen, _) = self.add_response_events(req)?;
        Ok((req, chosen))
    }

    // ---- thread, blocking, and ordering queries ----

    /// The happens-before order on events: irreflexive, induced by
    /// program order and the synchronized-with dependencies.
    pub fn happens_before(&self, a: EventId, b: EventId) -> bool {
        self.structure.events().lt(a, b)
    }

    pub fn is_active(&self, t: ThreadId) -> bool {
        self.structure.is_active(t)
    }

    pub fn is_started_thread(&self, t: ThreadId) -> bool {
        self.structure.is_started_thread(t)
    }

    pub fn is_finished_thread(&self, t: ThreadId) -> bool {
        self.structure.is_finished_thread(t)
    }

    pub fn is_blocked_request(&self, e: EventId) -> bool {
        self.structure.is_blocked_request(e)
    }

    pub fn is_blocked_awaiting_request(&self, e: EventId) -> bool {
        self.structure.is_blocked_awaiting_request(e)
    }

    pub fn get_blocked_request(&self, t: ThreadId) -> Option<EventId> {
        self.structure.get_blocked_request(t)
    }
}
