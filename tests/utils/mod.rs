//! A miniature instrumented runtime driving the exploration core.
//!
//! Test programs are per-thread operation lists interpreted against the
//! `Explorer` façade: a main thread allocates the shared objects, forks
//! the user threads, joins them and takes the final reads, while user
//! threads execute their operations cooperatively. During replay only
//! the thread owning the next scripted event is stepped; afterwards
//! threads run left-to-right, retrying blocked requests as responses
//! become available.

use std::collections::{BTreeSet, VecDeque};

use log::LevelFilter;
use simplelog::{CombinedLogger, SimpleLogger};
use std::sync::Once;

use memforge::thread::{construct_thread_id, main_thread_id};
use memforge::{Config, EventId, Explorer, Loc, ObjectId, Stats, ThreadId, Val};

static INIT_LOG: Once = Once::new();

#[allow(dead_code)] // Only used in tests
pub fn init_log() {
    INIT_LOG.call_once(|| {
        CombinedLogger::init(vec![SimpleLogger::new(
            LevelFilter::Trace,
            simplelog::Config::default(),
        )])
        .unwrap()
    });
}

/// A mutex or plain object handle for test programs.
#[allow(dead_code)] // Only used in tests
pub fn mutex(i: u64) -> ObjectId {
    ObjectId::new(1 + i)
}

#[allow(dead_code)] // Only used in tests
pub fn object(i: u64) -> ObjectId {
    ObjectId::new(100 + i)
}

/// Operand of a write: a constant, or a previously read value plus a
/// constant.
#[derive(Clone, Copy, Debug)]
pub enum Operand {
    Const(u64),
    ReadPlus(usize, u64),
}

/// One operation of a user thread.
#[derive(Clone, Debug)]
#[allow(dead_code)] // Not every test uses every operation
pub enum Op {
    Read(Loc),
    Write(Loc, Operand),
    Lock(ObjectId),
    LockNested(ObjectId, u32),
    Unlock(ObjectId),
    UnlockNested(ObjectId, u32),
    Wait(ObjectId),
    Notify(ObjectId),
    NotifyAll(ObjectId),
    Park,
    Unpark(usize),
    Alloc(ObjectId),
    WriteRef(Loc, ObjectId),
    /// Reads a reference; if it is non-null, also reads the referent's
    /// field at the given offset.
    ReadRefThenField(Loc, u32),
}

#[derive(Clone, Debug, Default)]
pub struct TestProgram {
    pub threads: Vec<Vec<Op>>,
    /// Objects the main thread allocates before forking.
    pub mutexes: Vec<ObjectId>,
    /// Locations the main thread reads after joining.
    pub final_reads: Vec<Loc>,
}

/// The observable result of one complete execution.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Outcome {
    /// Values read by each user thread, in program order.
    pub reads: Vec<Vec<u64>>,
    /// Values of the final reads taken by the main thread.
    pub finals: Vec<u64>,
}

pub struct ExploreResult {
    pub outcomes: Vec<Outcome>,
    pub stats: Stats,
}

impl ExploreResult {
    #[allow(dead_code)] // Only used in tests
    pub fn outcome_set(&self) -> BTreeSet<Outcome> {
        self.outcomes.iter().cloned().collect()
    }
}

// Low-level steps, each appending at most one request/response pair.
#[derive(Clone, Debug)]
enum Micro {
    Start,
    Read(Loc),
    Write(Loc, Operand),
    WriteRef(Loc, ObjectId),
    ReadRef(Loc, u32),
    Lock { m: ObjectId, depth: u32, wait: bool },
    Unlock { m: ObjectId, depth: u32, wait: bool },
    WaitReq(ObjectId),
    Notify { m: ObjectId, all: bool },
    ParkReq,
    Unpark(usize),
    Alloc(ObjectId),
    Fork,
    Join,
    FinalRead(Loc),
    Finish,
}

fn expand(op: &Op) -> Vec<Micro> {
    match op {
        Op::Read(loc) => vec![Micro::Read(*loc)],
        Op::Write(loc, v) => vec![Micro::Write(*loc, *v)],
        Op::Lock(m) => vec![Micro::Lock {
            m: *m,
            depth: 1,
            wait: false,
        }],
        Op::LockNested(m, depth) => vec![Micro::Lock {
            m: *m,
            depth: *depth,
            wait: false,
        }],
        Op::Unlock(m) => vec![Micro::Unlock {
            m: *m,
            depth: 1,
            wait: false,
        }],
        Op::UnlockNested(m, depth) => vec![Micro::Unlock {
            m: *m,
            depth: *depth,
            wait: false,
        }],
        // A wait releases the mutex, awaits a notification, and
        // reacquires the mutex.
        Op::Wait(m) => vec![
            Micro::Unlock {
                m: *m,
                depth: 1,
                wait: true,
            },
            Micro::WaitReq(*m),
            Micro::Lock {
                m: *m,
                depth: 1,
                wait: true,
            },
        ],
        Op::Notify(m) => vec![Micro::Notify { m: *m, all: false }],
        Op::NotifyAll(m) => vec![Micro::Notify { m: *m, all: true }],
        Op::Park => vec![Micro::ParkReq],
        Op::Unpark(i) => vec![Micro::Unpark(*i)],
        Op::Alloc(o) => vec![Micro::Alloc(*o)],
        Op::WriteRef(loc, o) => vec![Micro::WriteRef(*loc, *o)],
        Op::ReadRefThenField(loc, offset) => vec![Micro::ReadRef(*loc, *offset)],
    }
}

struct ThreadState {
    tid: ThreadId,
    micros: Vec<Micro>,
    pc: usize,
    /// Dynamically injected steps (the field read of `ReadRefThenField`).
    injected: VecDeque<Micro>,
    pending: Option<EventId>,
    reads: Vec<u64>,
    finals: Vec<u64>,
    done: bool,
}

impl ThreadState {
    fn next_micro(&self) -> Option<Micro> {
        self.injected
            .front()
            .cloned()
            .or_else(|| self.micros.get(self.pc).cloned())
    }

    fn advance(&mut self) {
        if self.injected.pop_front().is_none() {
            self.pc += 1;
        }
    }

    fn operand(&self, v: Operand) -> u64 {
        match v {
            Operand::Const(c) => c,
            Operand::ReadPlus(i, d) => self.reads[i] + d,
        }
    }
}

enum End {
    Complete(Outcome),
    Deadlock,
    Inconsistent,
}

struct Runtime {
    threads: Vec<ThreadState>,
    user_tids: Vec<ThreadId>,
    forked: bool,
}

impl Runtime {
    fn new(program: &TestProgram) -> Self {
        let user_tids: Vec<ThreadId> = (0..program.threads.len())
            .map(|i| construct_thread_id(2 + i as u32))
            .collect();

        let mut main_micros = vec![Micro::Start];
        main_micros.extend(program.mutexes.iter().map(|&m| Micro::Alloc(m)));
        main_micros.push(Micro::Fork);
        main_micros.push(Micro::Join);
        main_micros.extend(program.final_reads.iter().map(|&l| Micro::FinalRead(l)));
        main_micros.push(Micro::Finish);

        let mut threads = vec![ThreadState {
            tid: main_thread_id(),
            micros: main_micros,
            pc: 0,
            injected: VecDeque::new(),
            pending: None,
            reads: Vec::new(),
            finals: Vec::new(),
            done: false,
        }];
        for (i, ops) in program.threads.iter().enumerate() {
            let mut micros = vec![Micro::Start];
            micros.extend(ops.iter().flat_map(expand));
            micros.push(Micro::Finish);
            threads.push(ThreadState {
                tid: user_tids[i],
                micros,
                pc: 0,
                injected: VecDeque::new(),
                pending: None,
                reads: Vec::new(),
                finals: Vec::new(),
                done: false,
            });
        }
        Self {
            threads,
            user_tids,
            forked: false,
        }
    }

    /// Steps one thread; returns whether it made progress.
    fn step(&mut self, ex: &mut Explorer, i: usize) -> bool {
        let tid = self.threads[i].tid;

        // A blocked request is retried until a response is available.
        if let Some(req) = self.threads[i].pending {
            let (chosen, _) = ex.add_response_events(req).unwrap();
            match chosen {
                None => return false,
                Some(_) => {
                    let state = &mut self.threads[i];
                    state.pending = None;
                    state.advance();
                    return true;
                }
            }
        }

        let micro = match self.threads[i].next_micro() {
            Some(m) => m,
            None => {
                self.threads[i].done = true;
                return true;
            }
        };
        match micro {
            Micro::Start => {
                let resp = ex.add_thread_start(tid).unwrap();
                assert!(resp.is_some(), "thread {} started before its fork", tid);
            }
            Micro::Read(loc) => {
                let v = ex.add_read_event(tid, loc, false).unwrap();
                let v = v.expect("reads never block");
                self.threads[i].reads.push(v.bits());
            }
            Micro::Write(loc, operand) => {
                let v = self.threads[i].operand(operand);
                ex.add_write_event(tid, loc, Val::int(v), false).unwrap();
            }
            Micro::WriteRef(loc, obj) => {
                ex.add_write_event(tid, loc, Val::reference(obj), false)
                    .unwrap();
            }
            Micro::ReadRef(loc, offset) => {
                let v = ex
                    .add_read_event(tid, loc, false)
                    .unwrap()
                    .expect("reads never block");
                self.threads[i].reads.push(v.bits());
                if let Some(obj) = v.as_object() {
                    self.threads[i]
                        .injected
                        .push_back(Micro::Read(Loc::new(obj, offset)));
                }
            }
            Micro::Lock { m, depth, wait } => {
                let req = ex.add_lock_request(tid, m, depth, wait).unwrap();
                match ex.add_lock_response(req).unwrap() {
                    Some(_) => {}
                    None => {
                        self.threads[i].pending = Some(req);
                        return true;
                    }
                }
            }
            Micro::Unlock { m, depth, wait } => {
                ex.add_unlock(tid, m, depth, wait).unwrap();
            }
            Micro::WaitReq(m) => {
                let req = ex.add_wait_request(tid, m).unwrap();
                match ex.add_wait_response(req).unwrap() {
                    Some(_) => {}
                    None => {
                        self.threads[i].pending = Some(req);
                        return true;
                    }
                }
            }
            Micro::Notify { m, all } => {
                ex.add_notify(tid, m, all).unwrap();
            }
            Micro::ParkReq => {
                let req = ex.add_park_request(tid).unwrap();
                match ex.add_park_response(req).unwrap() {
                    Some(_) => {}
                    None => {
                        self.threads[i].pending = Some(req);
                        return true;
                    }
                }
            }
            Micro::Unpark(target) => {
                let target = self.user_tids[target];
                ex.add_unpark(tid, target).unwrap();
            }
            Micro::Alloc(obj) => {
                ex.add_object_allocation(tid, obj).unwrap();
            }
            Micro::Fork => {
                let tids: BTreeSet<ThreadId> = self.user_tids.iter().copied().collect();
                ex.add_thread_fork(tid, tids).unwrap();
                self.forked = true;
            }
            Micro::Join => {
                let tids: BTreeSet<ThreadId> = self.user_tids.iter().copied().collect();
                let (req, resp) = ex.add_thread_join(tid, tids).unwrap();
                if resp.is_none() {
                    self.threads[i].pending = Some(req);
                    return true;
                }
            }
            Micro::FinalRead(loc) => {
                let v = ex
                    .add_read_event(tid, loc, false)
                    .unwrap()
                    .expect("reads never block");
                self.threads[i].finals.push(v.bits());
            }
            Micro::Finish => {
                ex.add_thread_finish(tid).unwrap();
            }
        }
        self.threads[i].advance();
        true
    }

    fn steppable(&self, i: usize) -> bool {
        if self.threads[i].done {
            return false;
        }
        // User threads only run once forked.
        i == 0 || self.forked
    }

    fn run(&mut self, ex: &mut Explorer) -> End {
        loop {
            if ex.detected_inconsistency().is_some() {
                ex.abort_exploration();
                return End::Inconsistent;
            }
            if self.threads.iter().all(|t| t.done) {
                let reads = self
                    .threads
                    .iter()
                    .skip(1)
                    .map(|t| t.reads.clone())
                    .collect();
                let finals = self.threads[0].finals.clone();
                return End::Complete(Outcome { reads, finals });
            }

            if ex.is_replaying() {
                let owner = (0..self.threads.len())
                    .find(|&i| !self.threads[i].done && ex.can_replay_next_event(self.threads[i].tid));
                match owner {
                    Some(i) => {
                        assert!(self.step(ex, i), "replay made no progress");
                        continue;
                    }
                    None => panic!(
                        "replay is stuck, no runtime thread owns the next scripted event:\n{}",
                        ex.print_execution()
                    ),
                }
            }

            let mut progressed = false;
            for i in 0..self.threads.len() {
                if self.steppable(i) && self.step(ex, i) {
                    progressed = true;
                    break;
                }
            }
            if !progressed {
                return End::Deadlock;
            }
        }
    }

}

/// Explores every behavior of the program and returns the outcomes of
/// the consistent complete executions.
pub fn explore(program: &TestProgram, config: Config) -> ExploreResult {
    let mut ex = Explorer::new(config, Box::new(|_| Val::int(0)));
    ex.initialize_exploration();
    let mut outcomes = Vec::new();
    loop {
        let mut runtime = Runtime::new(program);
        match runtime.run(&mut ex) {
            End::Complete(outcome) => {
                if ex.check_consistency().is_none() {
                    outcomes.push(outcome);
                }
            }
            End::Deadlock | End::Inconsistent => {}
        }
        if !ex.start_next_exploration() {
            break;
        }
    }
    ExploreResult {
        outcomes,
        stats: ex.stats().clone(),
    }
}
