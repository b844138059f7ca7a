//! Thread identifiers used throughout the event structure.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// A unique identifier for a thread of the test under exploration.
///
/// Identifiers are small, dense, non-negative integers assigned by the
/// instrumented runtime; the core uses them as indices into its
/// per-thread tables and serializes them as plain integers. A run of
/// `n` user threads reserves two extra identifiers: the *init* thread,
/// which hosts the root event of the structure, and the *main* thread,
/// which runs the initialization logic of the test. User threads are
/// numbered after those two.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ThreadId(u32);

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Construct a `ThreadId` from a raw integer.
///
/// The instrumented runtime owns the numbering; the core only requires
/// that it is stable within an invocation.
pub fn construct_thread_id(numeric_id: u32) -> ThreadId {
    ThreadId(numeric_id)
}

/// The thread hosting the root event of the structure.
pub fn init_thread_id() -> ThreadId {
    ThreadId(0)
}

/// The thread running the test's initialization logic.
pub fn main_thread_id() -> ThreadId {
    ThreadId(1)
}

impl From<ThreadId> for u32 {
    fn from(tid: ThreadId) -> Self {
        tid.0
    }
}

impl From<ThreadId> for usize {
    fn from(tid: ThreadId) -> Self {
        tid.0 as usize
    }
}
