//! Bounded FIFO of messages waiting for a connection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Message waiting for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
    /// Flush attempts made so far
    pub attempts: u32,
}

impl QueuedMessage {
    pub fn new(payload: String) -> Self {
        Self {
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Bounded queue that evicts its oldest entry when full
#[derive(Debug)]
pub struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a message, returning the evicted oldest entry if the queue was full
    pub fn push(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(message);
        evicted
    }

    /// Swap the contents out for an empty queue
    pub fn take_all(&mut self) -> VecDeque<QueuedMessage> {
        std::mem::take(&mut self.entries)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn queue_never_exceeds_capacity(capacity in 1usize..20, pushes in 0usize..100) {
            let mut queue = MessageQueue::new(capacity);
            let mut evictions = 0;
            for i in 0..pushes {
                if queue.push(QueuedMessage::new(i.to_string())).is_some() {
                    evictions += 1;
                }
                prop_assert!(queue.len() <= capacity);
            }
            prop_assert_eq!(evictions, pushes.saturating_sub(capacity));
        }

        #[test]
        fn queue_keeps_newest_in_order(capacity in 1usize..20, pushes in 0usize..100) {
            let mut queue = MessageQueue::new(capacity);
            for i in 0..pushes {
                queue.push(QueuedMessage::new(i.to_string()));
            }
            let expected: Vec<String> = (pushes.saturating_sub(capacity)..pushes)
                .map(|i| i.to_string())
                .collect();
            let actual: Vec<String> = queue.iter().map(|m| m.payload.clone()).collect();
            prop_assert_eq!(actual, expected);
        }
    }

    fn payloads(queue: &MessageQueue) -> Vec<&str> {
        queue.iter().map(|m| m.payload.as_str()).collect()
    }

    #[test]
    fn test_push_within_capacity() {
        let mut queue = MessageQueue::new(3);
        assert!(queue.push(QueuedMessage::new("a".into())).is_none());
        assert!(queue.push(QueuedMessage::new("b".into())).is_none());
        assert_eq!(queue.len(), 2);
        assert_eq!(payloads(&queue), vec!["a", "b"]);
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut queue = MessageQueue::new(2);
        queue.push(QueuedMessage::new("a".into()));
        queue.push(QueuedMessage::new("b".into()));

        let evicted = queue.push(QueuedMessage::new("c".into()));
        assert_eq!(evicted.map(|m| m.payload), Some("a".to_string()));
        assert_eq!(queue.len(), 2);
        assert_eq!(payloads(&queue), vec!["b", "c"]);
    }

    #[test]
    fn test_take_all_leaves_empty_queue() {
        let mut queue = MessageQueue::new(4);
        queue.push(QueuedMessage::new("a".into()));
        queue.push(QueuedMessage::new("b".into()));

        let taken = queue.take_all();
        assert_eq!(taken.len(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 4);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut queue = MessageQueue::new(0);
        queue.push(QueuedMessage::new("a".into()));
        let evicted = queue.push(QueuedMessage::new("b".into()));
        assert!(evicted.is_some());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_new_message_defaults() {
        let message = QueuedMessage::new("hello".into());
        assert_eq!(message.attempts, 0);
        assert_eq!(message.payload, "hello");
    }
}
