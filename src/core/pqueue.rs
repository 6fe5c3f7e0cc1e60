//! Min-heap of messages keyed by their `pri` deadline.
//!
//! The queue keeps an id → heap-position index internally so removal by
//! message id is O(log n) and a message's map entry and heap slot always
//! move together.

use std::collections::HashMap;

use crate::core::message::{Message, MessageId};

#[derive(Default)]
pub struct PriorityQueue {
    heap: Vec<Message>,
    pos: HashMap<MessageId, usize>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            pos: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.pos.contains_key(id)
    }

    /// Owning client of the queued message, if present.
    pub fn owner(&self, id: &MessageId) -> Option<i64> {
        self.pos.get(id).map(|&i| self.heap[i].client_id)
    }

    /// Insert a message keyed by its `pri`. The message is handed back if a
    /// message with the same id is already queued.
    pub fn push(&mut self, msg: Message) -> Result<(), Message> {
        if self.pos.contains_key(&msg.id) {
            return Err(msg);
        }
        let i = self.heap.len();
        self.pos.insert(msg.id, i);
        self.heap.push(msg);
        self.up(i);
        Ok(())
    }

    /// Priority of the root entry.
    pub fn peek_pri(&self) -> Option<i64> {
        self.heap.first().map(|m| m.pri)
    }

    /// Pop the root entry iff its deadline is at or before `max`.
    pub fn peek_and_shift(&mut self, max: i64) -> Option<Message> {
        match self.peek_pri() {
            Some(pri) if pri <= max => self.remove_at(0),
            _ => None,
        }
    }

    /// Remove the entry with the given id, wherever it sits in the heap.
    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let i = *self.pos.get(id)?;
        self.remove_at(i)
    }

    /// Drain the queue in arbitrary order.
    pub fn drain(&mut self) -> Vec<Message> {
        self.pos.clear();
        std::mem::take(&mut self.heap)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.pos.clear();
    }

    fn remove_at(&mut self, i: usize) -> Option<Message> {
        if i >= self.heap.len() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(i, last);
        if i < last {
            self.pos.insert(self.heap[i].id, i);
        }
        let msg = self.heap.pop()?;
        self.pos.remove(&msg.id);
        if i < self.heap.len() {
            self.down(i);
            self.up(i);
        }
        Some(msg)
    }

    fn up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].pri <= self.heap[i].pri {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < self.heap.len() && self.heap[right].pri < self.heap[left].pri {
                smallest = right;
            }
            if self.heap[i].pri <= self.heap[smallest].pri {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.pos.insert(self.heap[a].id, a);
        self.pos.insert(self.heap[b].id, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn msg(tag: u8, pri: i64) -> Message {
        let mut m = Message::new(MessageId([tag; 16]), Bytes::from_static(b"t"));
        m.pri = pri;
        m
    }

    #[test]
    fn pops_in_priority_order() {
        let mut q = PriorityQueue::new();
        for (tag, pri) in [(1u8, 50i64), (2, 10), (3, 40), (4, 20), (5, 30)] {
            q.push(msg(tag, pri)).unwrap();
        }

        let mut out = Vec::new();
        while let Some(m) = q.peek_and_shift(i64::MAX) {
            out.push(m.pri);
        }
        assert_eq!(out, vec![10, 20, 30, 40, 50]);
        assert!(q.is_empty());
    }

    #[test]
    fn peek_and_shift_respects_the_deadline() {
        let mut q = PriorityQueue::new();
        q.push(msg(1, 100)).unwrap();
        q.push(msg(2, 200)).unwrap();

        assert_eq!(q.peek_and_shift(50).map(|m| m.pri), None);
        assert_eq!(q.peek_and_shift(100).map(|m| m.pri), Some(100));
        assert_eq!(q.peek_and_shift(150).map(|m| m.pri), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn removes_by_id_from_the_middle() {
        let mut q = PriorityQueue::new();
        for (tag, pri) in [(1u8, 10i64), (2, 20), (3, 30), (4, 40), (5, 50)] {
            q.push(msg(tag, pri)).unwrap();
        }

        let removed = q.remove(&MessageId([3; 16])).unwrap();
        assert_eq!(removed.pri, 30);
        assert!(!q.contains(&MessageId([3; 16])));

        let mut out = Vec::new();
        while let Some(m) = q.peek_and_shift(i64::MAX) {
            out.push(m.pri);
        }
        assert_eq!(out, vec![10, 20, 40, 50]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut q = PriorityQueue::new();
        q.push(msg(1, 10)).unwrap();
        assert!(q.push(msg(1, 99)).is_err());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn owner_tracks_the_queued_client() {
        let mut q = PriorityQueue::new();
        let mut m = msg(9, 10);
        m.client_id = 42;
        q.push(m).unwrap();

        assert_eq!(q.owner(&MessageId([9; 16])), Some(42));
        assert_eq!(q.owner(&MessageId([8; 16])), None);
    }

    #[test]
    fn index_survives_heavy_churn() {
        let mut q = PriorityQueue::new();
        for tag in 0..200u8 {
            q.push(msg(tag, (tag as i64 * 37) % 101)).unwrap();
        }
        for tag in (0..200u8).step_by(3) {
            assert!(q.remove(&MessageId([tag; 16])).is_some());
        }

        let mut last = i64::MIN;
        while let Some(m) = q.peek_and_shift(i64::MAX) {
            assert!(m.pri >= last);
            last = m.pri;
        }
    }
}
