//! Per-principal pending queues.

use std::collections::BTreeMap;

/// Ordering key for a queued operation: priority first, then arrival.
pub type SlotKey = (u8, u64);

/// Priority-ordered pending operations for one principal.
///
/// Keyed by `(priority, sequence)` so the first entry is always the next to
/// dispatch: the lowest priority number wins, ties resolve to the earliest
/// arrival. Sequences come from a process-wide monotonic counter, which makes
/// arrival order comparable across principals too.
#[derive(Debug, Default)]
pub struct PrincipalQueue {
    slots: BTreeMap<SlotKey, String>,
}

impl PrincipalQueue {
    pub fn insert(&mut self, priority: u8, seq: u64, op_id: String) {
        self.slots.insert((priority, seq), op_id);
    }

    /// The slot that would be dispatched next.
    pub fn peek(&self) -> Option<(SlotKey, &str)> {
        self.slots.iter().next().map(|(slot, id)| (*slot, id.as_str()))
    }

    pub fn pop_first(&mut self) -> Option<(SlotKey, String)> {
        self.slots.pop_first()
    }

    pub fn remove(&mut self, slot: SlotKey) -> Option<String> {
        self.slots.remove(&slot)
    }

    /// The slot with the earliest arrival regardless of priority - the
    /// eviction victim when the queue is full.
    pub fn oldest(&self) -> Option<SlotKey> {
        self.slots.keys().min_by_key(|(_, seq)| *seq).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_priority_dispatched_first() {
        let mut queue = PrincipalQueue::default();
        queue.insert(5, 0, "low".to_string());
        queue.insert(1, 1, "high".to_string());

        assert_eq!(queue.pop_first().unwrap().1, "high");
        assert_eq!(queue.pop_first().unwrap().1, "low");
        assert!(queue.pop_first().is_none());
    }

    #[test]
    fn test_fifo_within_priority_tier() {
        let mut queue = PrincipalQueue::default();
        queue.insert(2, 10, "first".to_string());
        queue.insert(2, 11, "second".to_string());
        queue.insert(2, 12, "third".to_string());

        assert_eq!(queue.pop_first().unwrap().1, "first");
        assert_eq!(queue.pop_first().unwrap().1, "second");
        assert_eq!(queue.pop_first().unwrap().1, "third");
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut queue = PrincipalQueue::default();
        queue.insert(1, 0, "a".to_string());

        assert_eq!(queue.peek().unwrap().1, "a");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_oldest_ignores_priority() {
        let mut queue = PrincipalQueue::default();
        // The urgent entry arrived later; the old low-priority one is still
        // the eviction victim.
        queue.insert(5, 0, "old".to_string());
        queue.insert(1, 1, "urgent".to_string());

        let victim = queue.oldest().unwrap();
        assert_eq!(queue.remove(victim).unwrap(), "old");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_missing_slot_is_noop() {
        let mut queue = PrincipalQueue::default();
        queue.insert(1, 0, "a".to_string());

        assert!(queue.remove((9, 9)).is_none());
        assert_eq!(queue.len(), 1);
    }
}
