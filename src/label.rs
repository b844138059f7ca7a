//! Labels of event-structure events.
//!
//! A label classifies the atomic action an event stands for, together
//! with its kind: a blocking operation splits into a *Request* the thread
//! issues and a *Response* that arrives once matching *Send*s exist;
//! non-blocking operations are plain Sends. Which labels compose into
//! which responses is the synchronization algebra's business (see
//! `algebra`); this module only carries the payloads.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::location::{Loc, ObjectId, Val};
use crate::thread::ThreadId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum LabelKind {
    Request,
    Response,
    Send,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum LabelEnum {
    Init(Init),
    Alloc(Alloc),
    TFork(TFork),
    TStart(TStart),
    TFinish(TFinish),
    TJoin(TJoin),
    Read(Read),
    Write(Write),
    Lock(Lock),
    Unlock(Unlock),
    Wait(Wait),
    Notify(Notify),
    Park(Park),
    Unpark(Unpark),
}

impl LabelEnum {
    pub(crate) fn kind(&self) -> LabelKind {
        match self {
            LabelEnum::Init(_)
            | LabelEnum::Alloc(_)
            | LabelEnum::TFork(_)
            | LabelEnum::TFinish(_)
            | LabelEnum::Write(_)
            | LabelEnum::Unlock(_)
            | LabelEnum::Notify(_)
            | LabelEnum::Unpark(_) => LabelKind::Send,
            LabelEnum::TStart(l) => l.kind,
            LabelEnum::TJoin(l) => l.kind,
            LabelEnum::Read(l) => l.kind,
            LabelEnum::Lock(l) => l.kind,
            LabelEnum::Wait(l) => l.kind,
            LabelEnum::Park(l) => l.kind,
        }
    }

    pub(crate) fn is_request(&self) -> bool {
        self.kind() == LabelKind::Request
    }

    pub(crate) fn is_response(&self) -> bool {
        self.kind() == LabelKind::Response
    }

    pub(crate) fn is_send(&self) -> bool {
        self.kind() == LabelKind::Send
    }

    /// Whether this label stops its thread until a response exists.
    ///
    /// A partial barrier response (a join still waiting on some threads)
    /// is also blocking: it must not enter the execution until complete.
    pub(crate) fn is_blocking(&self) -> bool {
        match self {
            LabelEnum::Lock(l) => l.kind == LabelKind::Request,
            LabelEnum::Wait(l) => l.kind == LabelKind::Request,
            LabelEnum::Park(l) => l.kind == LabelKind::Request,
            LabelEnum::TStart(l) => l.kind == LabelKind::Request,
            LabelEnum::TJoin(l) => l.kind == LabelKind::Request || !l.pending.is_empty(),
            _ => false,
        }
    }

    /// Whether a response label is complete and may enter the execution.
    pub(crate) fn is_unblocked(&self) -> bool {
        match self {
            LabelEnum::TJoin(l) => l.kind == LabelKind::Response && l.pending.is_empty(),
            _ => self.is_response(),
        }
    }

    pub(crate) fn is_exclusive(&self) -> bool {
        match self {
            LabelEnum::Read(l) => l.exclusive,
            LabelEnum::Write(l) => l.exclusive,
            _ => false,
        }
    }

    /// Reentrant lock acquisitions and releases synchronize trivially.
    pub(crate) fn is_reentry(&self) -> bool {
        match self {
            LabelEnum::Lock(l) => l.depth > 1,
            LabelEnum::Unlock(l) => l.depth > 1,
            _ => false,
        }
    }

    /// The memory location this label touches, if any.
    pub(crate) fn loc(&self) -> Option<Loc> {
        match self {
            LabelEnum::Read(l) => Some(l.loc),
            LabelEnum::Write(l) => Some(l.loc),
            _ => None,
        }
    }

    /// The object handle this label touches, if any.
    pub(crate) fn object(&self) -> Option<ObjectId> {
        match self {
            LabelEnum::Alloc(l) => Some(l.object),
            LabelEnum::Read(l) => Some(l.loc.object),
            LabelEnum::Write(l) => Some(l.loc.object),
            LabelEnum::Lock(l) => Some(l.mutex),
            LabelEnum::Unlock(l) => Some(l.mutex),
            LabelEnum::Wait(l) => Some(l.mutex),
            LabelEnum::Notify(l) => Some(l.mutex),
            _ => None,
        }
    }

    /// The value carried by the label, if any.
    pub(crate) fn value(&self) -> Option<Val> {
        match self {
            LabelEnum::Read(l) => l.value,
            LabelEnum::Write(l) => Some(l.value),
            _ => None,
        }
    }

    /// Validates that a freshly reported label replays the scripted one.
    ///
    /// Structural parameters must agree; anything that disagrees means
    /// the test program is not deterministic under the control of the
    /// core, which is reported to the surrounding runtime.
    pub(crate) fn compare_for_replay(&self, other: &Self) -> Result<(), String> {
        match (self, other) {
            (LabelEnum::Init(_), LabelEnum::Init(_)) => return Ok(()),
            (LabelEnum::Alloc(s), LabelEnum::Alloc(o)) => {
                if s.object == o.object {
                    return Ok(());
                }
                return Err(format!(
                    "Expected to allocate {} but allocated {}",
                    s.object, o.object
                ));
            }
            (LabelEnum::TFork(s), LabelEnum::TFork(o)) => {
                if s.tids == o.tids {
                    return Ok(());
                }
                return Err(format!(
                    "Expected to fork threads {:?} but forked {:?}",
                    s.tids, o.tids
                ));
            }
            (LabelEnum::TStart(s), LabelEnum::TStart(o)) => {
                if s.tid == o.tid {
                    return Ok(());
                }
                return Err(format!(
                    "Expected thread {} to start but {} started",
                    s.tid, o.tid
                ));
            }
            (LabelEnum::TFinish(s), LabelEnum::TFinish(o)) => {
                if s.tids == o.tids {
                    return Ok(());
                }
                return Err(format!(
                    "Expected threads {:?} to finish but got {:?}",
                    s.tids, o.tids
                ));
            }
            (LabelEnum::TJoin(s), LabelEnum::TJoin(o)) => {
                if s.pending == o.pending {
                    return Ok(());
                }
                return Err(format!(
                    "Expected to join threads {:?} but got {:?}",
                    s.pending, o.pending
                ));
            }
            (LabelEnum::Read(s), LabelEnum::Read(o)) => {
                if s.loc == o.loc && s.exclusive == o.exclusive {
                    return Ok(());
                }
                return Err(format!("Expected to read {} but read {}", s.loc, o.loc));
            }
            (LabelEnum::Write(s), LabelEnum::Write(o)) => {
                if s.loc != o.loc || s.exclusive != o.exclusive {
                    return Err(format!("Expected to write {} but wrote {}", s.loc, o.loc));
                }
                if s.value != o.value {
                    return Err(format!(
                        "Expected to write {} to {} but wrote {}",
                        s.value, s.loc, o.value
                    ));
                }
                return Ok(());
            }
            (LabelEnum::Lock(s), LabelEnum::Lock(o)) => {
                if s.mutex == o.mutex && s.depth == o.depth {
                    return Ok(());
                }
                return Err(format!(
                    "Expected to lock {} (depth {}) but locked {} (depth {})",
                    s.mutex, s.depth, o.mutex, o.depth
                ));
            }
            (LabelEnum::Unlock(s), LabelEnum::Unlock(o)) => {
                if s.mutex == o.mutex && s.depth == o.depth {
                    return Ok(());
                }
                return Err(format!(
                    "Expected to unlock {} but unlocked {}",
                    s.mutex, o.mutex
                ));
            }
            (LabelEnum::Wait(s), LabelEnum::Wait(o)) => {
                if s.mutex == o.mutex {
                    return Ok(());
                }
                return Err(format!(
                    "Expected to wait on {} but waited on {}",
                    s.mutex, o.mutex
                ));
            }
            (LabelEnum::Notify(s), LabelEnum::Notify(o)) => {
                if s.mutex == o.mutex && s.broadcast == o.broadcast {
                    return Ok(());
                }
                return Err(format!(
                    "Expected to notify {} but notified {}",
                    s.mutex, o.mutex
                ));
            }
            (LabelEnum::Park(_), LabelEnum::Park(_)) => return Ok(()),
            (LabelEnum::Unpark(s), LabelEnum::Unpark(o)) => {
                if s.tid == o.tid {
                    return Ok(());
                }
                return Err(format!(
                    "Expected to unpark {} but unparked {}",
                    s.tid, o.tid
                ));
            }
            _ => {}
        }

        Err(format!(
            "At this point in the thread, it should have {} but it {} instead.",
            self.action_descr(),
            other.action_descr()
        ))
    }

    pub(crate) fn action_descr(&self) -> String {
        match self {
            LabelEnum::Init(_) => "initialized the run".to_string(),
            LabelEnum::Alloc(_) => "allocated an object".to_string(),
            LabelEnum::TFork(_) => "forked a thread".to_string(),
            LabelEnum::TStart(_) => "started".to_string(),
            LabelEnum::TFinish(_) => "finished".to_string(),
            LabelEnum::TJoin(_) => "joined a thread".to_string(),
            LabelEnum::Read(l) => format!("read {}", l.loc),
            LabelEnum::Write(l) => format!("written {}", l.loc),
            LabelEnum::Lock(l) => format!("locked {}", l.mutex),
            LabelEnum::Unlock(l) => format!("unlocked {}", l.mutex),
            LabelEnum::Wait(l) => format!("waited on {}", l.mutex),
            LabelEnum::Notify(l) => format!("notified {}", l.mutex),
            LabelEnum::Park(_) => "parked".to_string(),
            LabelEnum::Unpark(l) => format!("unparked {}", l.tid),
        }
    }
}

fn kind_suffix(kind: LabelKind) -> &'static str {
    match kind {
        LabelKind::Request => "[req]",
        LabelKind::Response => "[resp]",
        LabelKind::Send => "",
    }
}

impl fmt::Display for LabelEnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelEnum::Init(_) => write!(f, "INIT"),
            LabelEnum::Alloc(l) => write!(f, "ALLOC({})", l.object),
            LabelEnum::TFork(l) => write!(f, "FORK({:?})", l.tids),
            LabelEnum::TStart(l) => write!(f, "START({}){}", l.tid, kind_suffix(l.kind)),
            LabelEnum::TFinish(l) => write!(f, "FINISH({:?})", l.tids),
            LabelEnum::TJoin(l) => write!(f, "JOIN({:?}){}", l.pending, kind_suffix(l.kind)),
            LabelEnum::Read(l) => match l.value {
                Some(v) => write!(f, "READ{}({}) = {}", if l.exclusive { "x" } else { "" }, l.loc, v),
                None => write!(f, "READ{}({}){}", if l.exclusive { "x" } else { "" }, l.loc, kind_suffix(l.kind)),
            },
            LabelEnum::Write(l) => {
                write!(f, "WRITE{}({}, {})", if l.exclusive { "x" } else { "" }, l.loc, l.value)
            }
            LabelEnum::Lock(l) => write!(f, "LOCK({})@{}{}", l.mutex, l.depth, kind_suffix(l.kind)),
            LabelEnum::Unlock(l) => write!(f, "UNLOCK({})@{}", l.mutex, l.depth),
            LabelEnum::Wait(l) => write!(f, "WAIT({}){}", l.mutex, kind_suffix(l.kind)),
            LabelEnum::Notify(l) => {
                if l.broadcast {
                    write!(f, "NOTIFYALL({})", l.mutex)
                } else {
                    write!(f, "NOTIFY({})", l.mutex)
                }
            }
            LabelEnum::Park(l) => write!(f, "PARK({}){}", l.tid, kind_suffix(l.kind)),
            LabelEnum::Unpark(l) => write!(f, "UNPARK({})", l.tid),
        }
    }
}

/// Root label: provides the initial contents of static memory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Init {
    pub(crate) main_tid: ThreadId,
}

impl Init {
    pub(crate) fn new(main_tid: ThreadId) -> Self {
        Self { main_tid }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Alloc {
    pub(crate) object: ObjectId,
}

impl Alloc {
    pub(crate) fn new(object: ObjectId) -> Self {
        Self { object }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TFork {
    pub(crate) tids: BTreeSet<ThreadId>,
}

impl TFork {
    pub(crate) fn new(tids: BTreeSet<ThreadId>) -> Self {
        Self { tids }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TStart {
    pub(crate) kind: LabelKind,
    pub(crate) tid: ThreadId,
}

impl TStart {
    pub(crate) fn request(tid: ThreadId) -> Self {
        Self {
            kind: LabelKind::Request,
            tid,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TFinish {
    pub(crate) tids: BTreeSet<ThreadId>,
}

impl TFinish {
    pub(crate) fn new(tid: ThreadId) -> Self {
        Self {
            tids: BTreeSet::from([tid]),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TJoin {
    pub(crate) kind: LabelKind,
    pub(crate) pending: BTreeSet<ThreadId>,
}

impl TJoin {
    pub(crate) fn request(tids: BTreeSet<ThreadId>) -> Self {
        Self {
            kind: LabelKind::Request,
            pending: tids,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Read {
    pub(crate) kind: LabelKind,
    pub(crate) loc: Loc,
    pub(crate) value: Option<Val>,
    pub(crate) exclusive: bool,
}

impl Read {
    pub(crate) fn request(loc: Loc, exclusive: bool) -> Self {
        Self {
            kind: LabelKind::Request,
            loc,
            value: None,
            exclusive,
        }
    }

    pub(crate) fn response(loc: Loc, value: Val, exclusive: bool) -> Self {
        Self {
            kind: LabelKind::Response,
            loc,
            value: Some(value),
            exclusive,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Write {
    pub(crate) loc: Loc,
    pub(crate) value: Val,
    pub(crate) exclusive: bool,
}

impl Write {
    pub(crate) fn new(loc: Loc, value: Val, exclusive: bool) -> Self {
        Self {
            loc,
            value,
            exclusive,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Lock {
    pub(crate) kind: LabelKind,
    pub(crate) mutex: ObjectId,
    /// Reentry depth of the acquisition; 1 is a plain acquire.
    pub(crate) depth: u32,
    /// Set when the acquisition is the tail half of a wait.
    pub(crate) is_wait_lock: bool,
}

impl Lock {
    pub(crate) fn request(mutex: ObjectId, depth: u32, is_wait_lock: bool) -> Self {
        Self {
            kind: LabelKind::Request,
            mutex,
            depth,
            is_wait_lock,
        }
    }

    pub(crate) fn response(&self) -> Self {
        Self {
            kind: LabelKind::Response,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Unlock {
    pub(crate) mutex: ObjectId,
    pub(crate) depth: u32,
    /// Set when the release is the head half of a wait.
    pub(crate) is_wait_unlock: bool,
}

impl Unlock {
    pub(crate) fn new(mutex: ObjectId, depth: u32, is_wait_unlock: bool) -> Self {
        Self {
            mutex,
            depth,
            is_wait_unlock,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Wait {
    pub(crate) kind: LabelKind,
    pub(crate) mutex: ObjectId,
}

impl Wait {
    pub(crate) fn request(mutex: ObjectId) -> Self {
        Self {
            kind: LabelKind::Request,
            mutex,
        }
    }

    pub(crate) fn response(mutex: ObjectId) -> Self {
        Self {
            kind: LabelKind::Response,
            mutex,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Notify {
    pub(crate) mutex: ObjectId,
    pub(crate) broadcast: bool,
}

impl Notify {
    pub(crate) fn new(mutex: ObjectId, broadcast: bool) -> Self {
        Self { mutex, broadcast }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Park {
    pub(crate) kind: LabelKind,
    pub(crate) tid: ThreadId,
}

impl Park {
    pub(crate) fn request(tid: ThreadId) -> Self {
        Self {
            kind: LabelKind::Request,
            tid,
        }
    }

    pub(crate) fn response(tid: ThreadId) -> Self {
        Self {
            kind: LabelKind::Response,
            tid,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Unpark {
    pub(crate) tid: ThreadId,
}

impl Unpark {
    pub(crate) fn new(tid: ThreadId) -> Self {
        Self { tid }
    }
}
