//! The synchronization algebra: which labels compose into responses.
//!
//! The algebra is the pair `syncable`/`sync`. `sync(a, b)` is defined
//! exactly when the two labels may synchronize, and then produces the
//! response label of the composition. Binary rules compose one Request
//! with one Send and are commutative; the join barrier folds one Request
//! with several Sends and is associative, so candidates can be folded
//! left-to-right in any grouping.

use std::collections::BTreeSet;

use crate::label::{LabelEnum, LabelKind, Park, Read, TFinish, TJoin, TStart, Wait};
use crate::location::{Loc, Val};

/// How a label participates in synchronization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncType {
    /// The label does not initiate synchronization (responses).
    None,
    /// One Request composes with one Send.
    Binary,
    /// All-or-nothing multi-party composition.
    Barrier,
}

/// Initial contents of a memory location on first observation.
///
/// Passed in by the instrumented runtime at startup and carried as
/// explicit context; the core has no process-wide state.
pub type MemoryInitializer = Box<dyn Fn(Loc) -> Val>;

pub(crate) trait SynchronizationAlgebra {
    fn sync(&self, a: &LabelEnum, b: &LabelEnum) -> Option<LabelEnum>;

    fn syncable(&self, a: &LabelEnum, b: &LabelEnum) -> bool {
        self.sync(a, b).is_some()
    }

    fn sync_type(&self, label: &LabelEnum) -> SyncType;
}

/// The stock algebra of the shared-memory model.
pub(crate) struct MemoryModelAlgebra {
    memory_initializer: MemoryInitializer,
}

impl MemoryModelAlgebra {
    pub(crate) fn new(memory_initializer: MemoryInitializer) -> Self {
        Self { memory_initializer }
    }

    fn initial_value(&self, loc: Loc) -> Val {
        (self.memory_initializer)(loc)
    }

    /// Binary composition with `req` a Request and `send` a Send.
    fn sync_request(&self, req: &LabelEnum, send: &LabelEnum) -> Option<LabelEnum> {
        match (req, send) {
            (LabelEnum::Read(r), LabelEnum::Write(w)) if r.loc == w.loc => Some(
                LabelEnum::Read(Read::response(r.loc, w.value, r.exclusive)),
            ),
            // The root event and allocation events act as the initializing
            // write for the locations they cover.
            (LabelEnum::Read(r), LabelEnum::Init(_)) if r.loc.object.is_static() => Some(
                LabelEnum::Read(Read::response(r.loc, self.initial_value(r.loc), r.exclusive)),
            ),
            (LabelEnum::Read(r), LabelEnum::Alloc(a)) if r.loc.object == a.object => Some(
                LabelEnum::Read(Read::response(r.loc, self.initial_value(r.loc), r.exclusive)),
            ),
            // A lock acquires either the allocation event (mutex free since
            // creation, or a reentrant acquisition) or a full release.
            (LabelEnum::Lock(l), LabelEnum::Alloc(a)) if l.mutex == a.object => {
                Some(LabelEnum::Lock(l.response()))
            }
            (LabelEnum::Lock(l), LabelEnum::Unlock(u))
                if l.mutex == u.mutex && !req.is_reentry() && u.depth == 1 =>
            {
                Some(LabelEnum::Lock(l.response()))
            }
            (LabelEnum::Wait(w), LabelEnum::Notify(n)) if w.mutex == n.mutex => {
                Some(LabelEnum::Wait(Wait::response(w.mutex)))
            }
            (LabelEnum::Park(p), LabelEnum::Unpark(u)) if p.tid == u.tid => {
                Some(LabelEnum::Park(Park::response(p.tid)))
            }
            (LabelEnum::TStart(s), LabelEnum::TFork(fork)) if fork.tids.contains(&s.tid) => {
                Some(LabelEnum::TStart(TStart {
                    kind: LabelKind::Response,
                    tid: s.tid,
                }))
            }
            (LabelEnum::TStart(s), LabelEnum::Init(init)) if s.tid == init.main_tid => {
                Some(LabelEnum::TStart(TStart {
                    kind: LabelKind::Response,
                    tid: s.tid,
                }))
            }
            _ => None,
        }
    }
}

impl SynchronizationAlgebra for MemoryModelAlgebra {
    fn sync(&self, a: &LabelEnum, b: &LabelEnum) -> Option<LabelEnum> {
        match (a, b) {
            // Join barrier: fold finished threads out of the pending set.
            (LabelEnum::TJoin(j), LabelEnum::TFinish(f))
            | (LabelEnum::TFinish(f), LabelEnum::TJoin(j)) => {
                if j.pending.is_disjoint(&f.tids) {
                    return None;
                }
                let pending: BTreeSet<_> =
                    j.pending.difference(&f.tids).copied().collect();
                Some(LabelEnum::TJoin(TJoin {
                    kind: LabelKind::Response,
                    pending,
                }))
            }
            // Finish labels merge, which is what makes the fold associative.
            (LabelEnum::TFinish(x), LabelEnum::TFinish(y)) => {
                let tids: BTreeSet<_> = x.tids.union(&y.tids).copied().collect();
                Some(LabelEnum::TFinish(TFinish { tids }))
            }
            _ => {
                if a.is_request() && b.is_send() {
                    self.sync_request(a, b)
                } else if b.is_request() && a.is_send() {
                    self.sync_request(b, a)
                } else {
                    None
                }
            }
        }
    }

    fn sync_type(&self, label: &LabelEnum) -> SyncType {
        match label {
            LabelEnum::TJoin(_) | LabelEnum::TFinish(_) => SyncType::Barrier,
            _ if label.is_response() => SyncType::None,
            _ => SyncType::Binary,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::label::{Alloc, Init, Lock, Notify, Unlock, Unpark, Write};
    use crate::location::ObjectId;
    use crate::thread::{construct_thread_id, main_thread_id};

    fn algebra() -> MemoryModelAlgebra {
        MemoryModelAlgebra::new(Box::new(|_| Val::int(0)))
    }

    #[test]
    fn read_write_is_commutative() {
        let a = algebra();
        let loc = Loc::global(0);
        let req = LabelEnum::Read(Read::request(loc, false));
        let send = LabelEnum::Write(Write::new(loc, Val::int(5), false));
        let resp = a.sync(&req, &send).unwrap();
        assert_eq!(resp, a.sync(&send, &req).unwrap());
        assert_eq!(resp.value(), Some(Val::int(5)));
        assert!(resp.is_response());
    }

    #[test]
    fn read_from_init_uses_the_initializer() {
        let a = MemoryModelAlgebra::new(Box::new(|loc: Loc| Val::int(loc.offset as u64 + 10)));
        let req = LabelEnum::Read(Read::request(Loc::global(3), false));
        let init = LabelEnum::Init(Init::new(main_thread_id()));
        let resp = a.sync(&req, &init).unwrap();
        assert_eq!(resp.value(), Some(Val::int(13)));
    }

    #[test]
    fn join_barrier_folds_associatively() {
        let a = algebra();
        let (t2, t3) = (construct_thread_id(2), construct_thread_id(3));
        let join = LabelEnum::TJoin(TJoin::request(BTreeSet::from([t2, t3])));
        let f2 = LabelEnum::TFinish(TFinish::new(t2));
        let f3 = LabelEnum::TFinish(TFinish::new(t3));

        // (join + f2) + f3
        let left = a.sync(&a.sync(&join, &f2).unwrap(), &f3).unwrap();
        // join + (f2 + f3)
        let right = a.sync(&join, &a.sync(&f2, &f3).unwrap()).unwrap();
        assert_eq!(left, right);
        assert!(left.is_unblocked());

        let partial = a.sync(&join, &f2).unwrap();
        assert!(partial.is_blocking());
        assert!(!partial.is_unblocked());
    }

    #[test]
    fn reentrant_lock_only_takes_the_allocation() {
        let a = algebra();
        let m = ObjectId::new(1);
        let reentrant = LabelEnum::Lock(Lock::request(m, 2, false));
        let unlock = LabelEnum::Unlock(Unlock::new(m, 1, false));
        let alloc = LabelEnum::Alloc(Alloc::new(m));
        assert!(a.sync(&reentrant, &unlock).is_none());
        assert!(a.sync(&reentrant, &alloc).is_some());

        // A reentrant release does not hand the mutex over.
        let fresh = LabelEnum::Lock(Lock::request(m, 1, false));
        let nested_unlock = LabelEnum::Unlock(Unlock::new(m, 2, false));
        assert!(a.sync(&fresh, &nested_unlock).is_none());
        assert!(a.sync(&fresh, &unlock).is_some());
    }

    #[test]
    fn park_matches_only_its_thread() {
        let a = algebra();
        let (t2, t3) = (construct_thread_id(2), construct_thread_id(3));
        let park = LabelEnum::Park(Park::request(t2));
        assert!(a.sync(&park, &LabelEnum::Unpark(Unpark::new(t2))).is_some());
        assert!(a.sync(&park, &LabelEnum::Unpark(Unpark::new(t3))).is_none());
    }

    #[test]
    fn notify_wakes_waiters() {
        let a = algebra();
        let m = ObjectId::new(4);
        let wait = LabelEnum::Wait(Wait::request(m));
        let notify = LabelEnum::Notify(Notify::new(m, false));
        let resp = a.sync(&wait, &notify).unwrap();
        assert!(resp.is_response());
        assert_eq!(a.sync_type(&resp), SyncType::None);
        assert_eq!(a.sync_type(&wait), SyncType::Binary);
    }
}
