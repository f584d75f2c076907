//! Outbound message queue for sends issued while disconnected.
//!
//! Messages are held in one bounded bucket per priority. When a bucket is
//! full the oldest message in that bucket is dropped (FIFO eviction), so
//! `enqueue` never fails and memory stays bounded. On reconnect the queue
//! is drained high -> normal -> low, FIFO within each bucket.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery priority for queued sends and subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Drain order
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// A pending outbound send awaiting a live connection
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub channel: String,
    /// Frame `type` written on the wire
    pub kind: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub priority: Priority,
    /// Failed write attempts so far
    pub retries: u32,
}

impl QueuedMessage {
    pub fn new(
        channel: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            kind: kind.into(),
            payload,
            enqueued_at: Utc::now(),
            priority,
            retries: 0,
        }
    }
}

/// Per-priority queue depth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

pub struct MessageQueue {
    buckets: [VecDeque<QueuedMessage>; 3],
    max_buffer: usize,
    dropped: u64,
}

impl MessageQueue {
    /// Create a queue whose buckets each hold at most `max_buffer` messages.
    pub fn new(max_buffer: usize) -> Self {
        Self {
            buckets: Default::default(),
            max_buffer: max_buffer.max(1),
            dropped: 0,
        }
    }

    /// Append `message` to its priority bucket.
    ///
    /// Returns the evicted message when the bucket overflowed.
    pub fn enqueue(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        let bucket = &mut self.buckets[message.priority.index()];

        let evicted = if bucket.len() >= self.max_buffer {
            bucket.pop_front()
        } else {
            None
        };

        if let Some(ref dropped) = evicted {
            self.dropped += 1;
            tracing::debug!(
                dropped_id = %dropped.id,
                channel = %dropped.channel,
                priority = dropped.priority.as_str(),
                "Dropped oldest message from full queue bucket"
            );
        }

        bucket.push_back(message);
        evicted
    }

    /// Put a message whose write failed back at the head of its bucket.
    ///
    /// If the bucket has refilled to capacity the message is dropped instead
    /// of displacing newer entries; the dropped message is returned.
    pub fn requeue_front(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        let bucket = &mut self.buckets[message.priority.index()];
        if bucket.len() >= self.max_buffer {
            self.dropped += 1;
            return Some(message);
        }
        bucket.push_front(message);
        None
    }

    /// One-shot lazy drain: all high, then normal, then low.
    ///
    /// Each message is removed as it is yielded; dropping the iterator early
    /// leaves the rest queued.
    pub fn drain_in_priority_order(&mut self) -> Drain<'_> {
        Drain {
            queue: self,
            bucket: 0,
        }
    }

    pub fn depth(&self) -> QueueDepth {
        QueueDepth {
            high: self.buckets[0].len(),
            normal: self.buckets[1].len(),
            low: self.buckets[2].len(),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    /// Messages evicted since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn max_buffer(&self) -> usize {
        self.max_buffer
    }
}

/// Iterator returned by [`MessageQueue::drain_in_priority_order`]
pub struct Drain<'a> {
    queue: &'a mut MessageQueue,
    bucket: usize,
}

impl Iterator for Drain<'_> {
    type Item = QueuedMessage;

    fn next(&mut self) -> Option<Self::Item> {
        while self.bucket < self.queue.buckets.len() {
            if let Some(message) = self.queue.buckets[self.bucket].pop_front() {
                return Some(message);
            }
            self.bucket += 1;
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining: usize = self.queue.buckets[self.bucket.min(3)..]
            .iter()
            .map(VecDeque::len)
            .sum();
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(n: u64, priority: Priority) -> QueuedMessage {
        QueuedMessage::new("alerts", "command", json!({ "n": n }), priority)
    }

    fn numbers(messages: impl Iterator<Item = QueuedMessage>) -> Vec<u64> {
        messages.map(|m| m.payload["n"].as_u64().unwrap()).collect()
    }

    #[test]
    fn test_drain_is_priority_then_fifo() {
        let mut queue = MessageQueue::new(10);
        queue.enqueue(msg(1, Priority::Low));
        queue.enqueue(msg(2, Priority::Normal));
        queue.enqueue(msg(3, Priority::High));
        queue.enqueue(msg(4, Priority::Normal));
        queue.enqueue(msg(5, Priority::High));

        let order = numbers(queue.drain_in_priority_order());
        assert_eq!(order, vec![3, 5, 2, 4, 1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest_in_bucket() {
        let mut queue = MessageQueue::new(3);
        for n in 1..=3 {
            assert!(queue.enqueue(msg(n, Priority::Normal)).is_none());
        }

        let evicted = queue.enqueue(msg(4, Priority::Normal)).unwrap();
        assert_eq!(evicted.payload["n"], 1);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.depth().normal, 3);

        let order = numbers(queue.drain_in_priority_order());
        assert_eq!(order, vec![2, 3, 4]);
    }

    #[test]
    fn test_overflow_does_not_touch_other_buckets() {
        let mut queue = MessageQueue::new(1);
        queue.enqueue(msg(1, Priority::High));
        queue.enqueue(msg(2, Priority::Low));
        queue.enqueue(msg(3, Priority::Low));

        assert_eq!(
            queue.depth(),
            QueueDepth {
                high: 1,
                normal: 0,
                low: 1
            }
        );
        assert_eq!(numbers(queue.drain_in_priority_order()), vec![1, 3]);
    }

    #[test]
    fn test_partial_drain_leaves_remaining() {
        let mut queue = MessageQueue::new(10);
        queue.enqueue(msg(1, Priority::High));
        queue.enqueue(msg(2, Priority::Low));

        {
            let mut drain = queue.drain_in_priority_order();
            assert_eq!(drain.size_hint(), (2, Some(2)));
            assert_eq!(drain.next().unwrap().payload["n"], 1);
        }

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.depth().low, 1);
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let mut queue = MessageQueue::new(3);
        queue.enqueue(msg(1, Priority::Normal));
        queue.enqueue(msg(2, Priority::Normal));

        let first = queue.drain_in_priority_order().next().unwrap();
        assert!(queue.requeue_front(first).is_none());

        assert_eq!(numbers(queue.drain_in_priority_order()), vec![1, 2]);
    }

    #[test]
    fn test_requeue_into_full_bucket_drops_message() {
        let mut queue = MessageQueue::new(1);
        queue.enqueue(msg(1, Priority::Normal));

        let rejected = queue.requeue_front(msg(9, Priority::Normal));
        assert_eq!(rejected.unwrap().payload["n"], 9);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = MessageQueue::new(0);
        assert_eq!(queue.max_buffer(), 1);
    }
}
