use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::message::Message;

/// Two-tier FIFO of messages waiting to be written to one bridge.
///
/// High-priority messages are always dequeued before normal ones. A single
/// mutex guards both tiers; every operation is O(1) amortised except
/// [`drain_all`](MessageQueue::drain_all).
#[derive(Debug, Default)]
pub struct MessageQueue {
    tiers: Mutex<Tiers>,
}

#[derive(Debug, Default)]
struct Tiers {
    high: VecDeque<Arc<Message>>,
    normal: VecDeque<Arc<Message>>,
}

impl Tiers {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }
}

impl MessageQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tiers> {
        self.tiers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes a message onto its tier.
    ///
    /// # Returns
    ///
    /// `true` if the queue was empty before the push.
    pub fn push(&self, msg: Arc<Message>) -> bool {
        let mut tiers = self.lock();
        let was_empty = tiers.len() == 0;
        if msg.is_high_priority() {
            tiers.high.push_back(msg);
        } else {
            tiers.normal.push_back(msg);
        }
        was_empty
    }

    /// Removes the next message, high tier first.
    pub fn pop(&self) -> Option<Arc<Message>> {
        let mut tiers = self.lock();
        tiers.high.pop_front().or_else(|| tiers.normal.pop_front())
    }

    /// Atomically empties both tiers, high-priority messages first.
    pub fn drain_all(&self) -> Vec<Arc<Message>> {
        let mut tiers = self.lock();
        let mut all = Vec::with_capacity(tiers.len());
        all.extend(tiers.high.drain(..));
        all.extend(tiers.normal.drain(..));
        all
    }

    /// Returns the message at the head of the queue if it is `verb`,
    /// without removing it.
    pub fn peek_if_command(&self, verb: &str) -> Option<Arc<Message>> {
        let tiers = self.lock();
        tiers
            .high
            .front()
            .or_else(|| tiers.normal.front())
            .filter(|msg| msg.is_command(verb))
            .cloned()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if both tiers are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::{get, ping};
    use crate::core::message::CommandFlags;

    fn normal(key: &'static str) -> Arc<Message> {
        Arc::new(Message::new(-1, CommandFlags::empty(), get(key)))
    }

    fn high(key: &'static str) -> Arc<Message> {
        Arc::new(Message::new(-1, CommandFlags::HIGH_PRIORITY, get(key)))
    }

    #[test]
    fn test_push_reports_empty_before() {
        let queue = MessageQueue::new();
        assert!(queue.push(normal("a")));
        assert!(!queue.push(normal("b")));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_pop_prefers_high_priority() {
        let queue = MessageQueue::new();
        let n1 = normal("n1");
        let n2 = normal("n2");
        let n3 = normal("n3");
        let h = high("h");
        queue.push(n1.clone());
        queue.push(n2.clone());
        queue.push(n3.clone());
        queue.push(h.clone());

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(order.len(), 4);
        assert!(Arc::ptr_eq(&order[0], &h));
        assert!(Arc::ptr_eq(&order[1], &n1));
        assert!(Arc::ptr_eq(&order[2], &n2));
        assert!(Arc::ptr_eq(&order[3], &n3));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_drain_all_returns_each_message_once() {
        let queue = MessageQueue::new();
        let mut pushed = Vec::new();
        for i in 0..50 {
            let msg = if i % 7 == 0 { high("h") } else { normal("n") };
            pushed.push(msg.clone());
            queue.push(msg);
        }

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 50);
        assert!(queue.is_empty());

        let first_normal = drained
            .iter()
            .position(|m| !m.is_high_priority())
            .unwrap();
        assert!(drained[..first_normal].iter().all(|m| m.is_high_priority()));
        assert!(drained[first_normal..].iter().all(|m| !m.is_high_priority()));
        for msg in &pushed {
            assert_eq!(drained.iter().filter(|d| Arc::ptr_eq(d, msg)).count(), 1);
        }
    }

    #[test]
    fn test_peek_if_command_does_not_remove() {
        let queue = MessageQueue::new();
        queue.push(Arc::new(Message::new(-1, CommandFlags::empty(), ping())));
        queue.push(normal("k"));

        assert!(queue.peek_if_command("PING").is_some());
        assert!(queue.peek_if_command("GET").is_none());
        assert_eq!(queue.len(), 2);

        queue.pop();
        assert!(queue.peek_if_command("GET").is_some());
    }
}
