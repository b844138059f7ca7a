//! Error taxonomy of the exploration core.
//!
//! Four kinds of failure exist, with different propagation:
//!
//! * internal data-model preconditions `panic!` — a violated invariant is
//!   a bug in the core, not in the test under exploration;
//! * a [`CausalityViolation`] is not an error value at all: event
//!   creation returns `None` and the caller skips that synchronization
//!   candidate;
//! * an [`Inconsistency`] prunes the current exploration; it is recorded
//!   once and is idempotent for the rest of the exploration;
//! * a [`ModelError`] is fatal for the invocation and is bubbled up to
//!   the surrounding runtime.

use std::fmt;

use thiserror::Error;

use crate::event::EventId;
use crate::thread::ThreadId;

/// The checker rejected the current execution.
///
/// This prunes the exploration branch; it does not indicate a bug in
/// either the core or the test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inconsistency {
    /// A read observes a write that is happens-before-overwritten.
    ReleaseAcquire {
        read: EventId,
        write: EventId,
        overwrite: EventId,
    },
    /// No total execution order extends hb and reads-from.
    SequentialConsistency,
    /// Two read-modify-write operations observed the same write, or a
    /// write slipped between a read-exclusive and its paired write.
    Atomicity { first: EventId, second: EventId },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::ReleaseAcquire {
                read,
                write,
                overwrite,
            } => write!(
                f,
                "read {} observes {} although {} overwrites it",
                read, write, overwrite
            ),
            Inconsistency::SequentialConsistency => {
                write!(f, "no sequentially consistent execution order exists")
            }
            Inconsistency::Atomicity { first, second } => write!(
                f,
                "atomicity violation between {} and {}",
                first, second
            ),
        }
    }
}

/// Fatal errors reported to the surrounding runtime as a distinct
/// invocation outcome.
#[derive(Error, Debug)]
pub enum ModelError {
    /// The replayer and the runtime disagree on the next event. Test
    /// programs must be deterministic under the control of the core.
    #[error("replay diverged on thread {thread}: {reason}")]
    ReplayDesync { thread: ThreadId, reason: String },
}
