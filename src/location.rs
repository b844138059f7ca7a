//! Memory locations, opaque object handles, and values.

use std::collections::HashMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::event::EventId;

/// An opaque handle to an object of the program under test.
///
/// Handles are minted by the instrumented runtime; the core treats them
/// purely as identities. The reserved [`ObjectId::STATIC`] handle names
/// static memory, whose contents come from the memory initializer rather
/// than from an allocation event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    pub const STATIC: ObjectId = ObjectId(0);

    pub fn new(raw: u64) -> Self {
        ObjectId(raw)
    }

    pub fn is_static(self) -> bool {
        self == Self::STATIC
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_static() {
            write!(f, "static")
        } else {
            write!(f, "obj#{}", self.0)
        }
    }
}

/// A memory location: a field (or array slot) of an object.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Loc {
    pub object: ObjectId,
    pub offset: u32,
}

impl Loc {
    pub fn new(object: ObjectId, offset: u32) -> Self {
        Loc { object, offset }
    }

    /// A location in static memory.
    pub fn global(offset: u32) -> Self {
        Loc {
            object: ObjectId::STATIC,
            offset,
        }
    }
}

impl Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object, self.offset)
    }
}

/// The shape of a value, as reported by the instrumented runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValKind {
    #[default]
    Int,
    Ref,
}

/// An opaque value flowing through reads and writes.
///
/// The core never interprets values beyond equality; the bits are
/// whatever encoding the runtime chose for the location's type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Val {
    bits: u64,
    kind: ValKind,
}

impl Val {
    pub fn int(bits: u64) -> Self {
        Val {
            bits,
            kind: ValKind::Int,
        }
    }

    pub fn reference(obj: ObjectId) -> Self {
        Val {
            bits: {
                let ObjectId(raw) = obj;
                raw
            },
            kind: ValKind::Ref,
        }
    }

    /// The default contents of a freshly allocated location.
    pub fn zero(kind: ValKind) -> Self {
        Val { bits: 0, kind }
    }

    pub fn bits(self) -> u64 {
        self.bits
    }

    pub fn kind(self) -> ValKind {
        self.kind
    }

    pub fn is_zero(self) -> bool {
        self.bits == 0
    }

    pub fn as_object(self) -> Option<ObjectId> {
        match self.kind {
            ValKind::Ref if self.bits != 0 => Some(ObjectId(self.bits)),
            _ => None,
        }
    }
}

impl Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ValKind::Int => write!(f, "{}", self.bits),
            ValKind::Ref if self.bits == 0 => write!(f, "null"),
            ValKind::Ref => write!(f, "&obj#{}", self.bits),
        }
    }
}

/// Identity-indexed map from allocated object handles to their
/// allocation events.
#[derive(Clone, Debug, Default)]
pub(crate) struct AllocationMap {
    map: HashMap<ObjectId, EventId>,
}

impl AllocationMap {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, object: ObjectId, event: EventId) {
        self.map.insert(object, event);
    }

    pub(crate) fn get(&self, object: ObjectId) -> Option<EventId> {
        self.map.get(&object).copied()
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
    }
}
