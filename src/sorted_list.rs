use serde::{Deserialize, Serialize};

use crate::event::EventId;

/// A list of event ids sorted in ascending id order.
///
/// The per-thread event sequences of an execution are stored this way:
/// ids grow monotonically within a thread, so pushes keep the list
/// sorted and the index of an id equals its thread position. Membership
/// queries are binary searches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SortedList {
    ids: Vec<EventId>,
}

impl SortedList {
    pub(crate) fn new() -> Self {
        Self { ids: Vec::new() }
    }

    /// Appends an id; the id must be greater than the current last.
    pub(crate) fn push(&mut self, id: EventId) {
        assert!(
            self.ids.last().is_none_or(|&last| last < id),
            "event id {} breaks the sort order (last is {:?})",
            id,
            self.ids.last()
        );
        self.ids.push(id);
    }

    pub(crate) fn pop(&mut self) -> Option<EventId> {
        self.ids.pop()
    }

    /// Drops all entries at index `pos` and later.
    pub(crate) fn truncate(&mut self, pos: usize) {
        self.ids.truncate(pos);
    }

    pub(crate) fn get(&self, pos: usize) -> Option<EventId> {
        self.ids.get(pos).copied()
    }

    pub(crate) fn first(&self) -> Option<EventId> {
        self.ids.first().copied()
    }

    pub(crate) fn last(&self) -> Option<EventId> {
        self.ids.last().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub(crate) fn contains(&self, id: EventId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = EventId> + '_ {
        self.ids.iter().copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(raw: u32) -> EventId {
        EventId::from_raw(raw)
    }

    #[test]
    fn push_keeps_order() {
        let mut l = SortedList::new();
        l.push(id(0));
        l.push(id(3));
        l.push(id(7));
        assert_eq!(l.len(), 3);
        assert_eq!(l.get(1), Some(id(3)));
        assert!(l.contains(id(7)));
        assert!(!l.contains(id(5)));
    }

    #[test]
    #[should_panic(expected = "breaks the sort order")]
    fn push_rejects_smaller_id() {
        let mut l = SortedList::new();
        l.push(id(4));
        l.push(id(2));
    }

    #[test]
    fn truncate_drops_suffix() {
        let mut l = SortedList::new();
        l.push(id(1));
        l.push(id(2));
        l.push(id(5));
        l.truncate(1);
        assert_eq!(l.last(), Some(id(1)));
        assert!(!l.contains(id(5)));
    }
}
