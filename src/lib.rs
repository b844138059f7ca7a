//! memforge — event-structure exploration core for a shared-memory
//! concurrency model checker.
//!
//! Given a bounded concurrent test, the core enumerates, without
//! redundancy, every behavior the configured memory model permits, and
//! prunes the behaviors the consistency checker rejects. The core does
//! not run user code: an instrumented runtime drives it through the
//! append operations of [`Explorer`] and asks which response each
//! blocking operation takes.

mod algebra;
mod cons;
mod error;
mod event;
mod event_structure;
mod execution;
mod explorer;
mod indexed_map;
mod label;
mod location;
mod replay;
mod sorted_list;
pub mod thread;
mod vector_clock;

pub use algebra::MemoryInitializer;
pub use error::{Inconsistency, ModelError};
pub use event::EventId;
pub use explorer::{Explorer, ThreadSwitchCallback};
pub use location::{Loc, ObjectId, Val, ValKind};
pub use thread::ThreadId;

use serde::{Deserialize, Serialize};

/// Exploration statistics.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct Stats {
    /// Completed, consistent executions explored.
    pub executions: usize,
    /// Executions that ended with some thread still blocked.
    pub blocked: usize,
    /// Explorations pruned by the consistency checker.
    pub inconsistent: usize,
}

/// The memory consistency model the checker enforces.
#[derive(PartialEq, Eq, Default, Clone, Copy, Serialize, Deserialize, Debug)]
pub enum MemoryModel {
    /// A total execution order must extend hb and reads-from.
    #[default]
    SequentialConsistency,
    /// Only the release-acquire fragment: reads must not observe
    /// hb-overwritten writes.
    ReleaseAcquire,
}

/// Core configuration options.
///
/// Use the [`ConfigBuilder`] class to construct a `Config` struct.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    pub(crate) memory_model: MemoryModel,
    pub(crate) max_explorations: Option<u64>,
    pub(crate) verbose: usize,
    pub(crate) thread_threshold: u32,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/// Builds a [`Config`] struct.
pub struct ConfigBuilder(Config);

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder(Config {
            memory_model: MemoryModel::SequentialConsistency,
            max_explorations: None,
            verbose: 0,
            thread_threshold: 1000,
        })
    }

    /// Specifies the memory consistency model to explore under.
    pub fn with_memory_model(mut self, m: MemoryModel) -> Self {
        self.0.memory_model = m;
        self
    }

    /// Specifies an upper bound on the number of explorations.
    pub fn with_max_explorations(mut self, n: u64) -> Self {
        self.0.max_explorations = Some(n);
        self
    }

    /// Controls how much output is printed to `stdout`:
    /// 0 = nothing, 1 = every complete execution,
    /// 2 = also blocked and inconsistent executions.
    pub fn with_verbose(mut self, v: usize) -> Self {
        self.0.verbose = v;
        self
    }

    /// Specifies the per-thread event count above which the core warns
    /// about a potentially unbounded test.
    pub fn with_thread_threshold(mut self, s: u32) -> Self {
        self.0.thread_threshold = s;
        self
    }

    pub fn build(self) -> Config {
        self.0
    }
}
