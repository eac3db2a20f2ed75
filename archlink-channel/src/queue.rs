//! # Outbound Command Queue
//!
//! FIFO of commands waiting for transport-level delivery. Producers never
//! block; a single consumer (the drain loop) takes commands in order and only
//! while the link is up. Failed transmissions go back to the tail with their
//! attempt count bumped, and are dropped once the count reaches the cap.

use crate::correlator::CorrelationId;
use crate::error::{self, Result};
use crate::message::Message;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A command awaiting delivery
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub id: CorrelationId,
    pub command: Message,
    pub enqueued_at: Instant,
    pub attempts: u32,
    /// A caller waits on the correlator for this command's reply
    pub tracked: bool,
}

impl QueuedCommand {
    pub fn new(id: CorrelationId, command: Message) -> Self {
        Self {
            id,
            command,
            enqueued_at: Instant::now(),
            attempts: 0,
            tracked: true,
        }
    }

    /// A command nobody waits on; replies surface as unsolicited
    pub fn untracked(id: CorrelationId, command: Message) -> Self {
        Self {
            tracked: false,
            ..Self::new(id, command)
        }
    }
}

#[derive(Debug)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<QueuedCommand>>,
    ready: Notify,
    capacity: Option<usize>,
}

impl OutboundQueue {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Add a new command at the tail; fails only when bounded and full
    pub fn enqueue(&self, item: QueuedCommand) -> Result<()> {
        {
            let mut items = self.lock();
            if let Some(capacity) = self.capacity {
                if items.len() >= capacity {
                    return Err(error::queue_full(capacity).with_operation("queue::enqueue"));
                }
            }
            items.push_back(item);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Put a command back at the tail after a failed transmission.
    ///
    /// Returns the command instead when it has used up `max_attempts`.
    pub fn requeue(&self, mut item: QueuedCommand, max_attempts: u32) -> Option<QueuedCommand> {
        item.attempts += 1;
        if item.attempts >= max_attempts {
            return Some(item);
        }
        // capacity only limits new submissions; a retry always gets its place back
        self.lock().push_back(item);
        self.ready.notify_one();
        None
    }

    /// Return a command taken with [`next`](Self::next) to the head without
    /// counting an attempt, e.g. when the link vanished before the write started.
    pub fn restore(&self, item: QueuedCommand) {
        self.lock().push_front(item);
        self.ready.notify_one();
    }

    /// Take the head of the queue, suspending while it is empty.
    ///
    /// Single consumer: the stored `Notify` permit covers an enqueue racing the wait.
    pub async fn next(&self) -> QueuedCommand {
        loop {
            if let Some(item) = self.lock().pop_front() {
                return item;
            }
            self.ready.notified().await;
        }
    }

    pub fn try_next(&self) -> Option<QueuedCommand> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedCommand>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::message::Category;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn command(name: &str) -> QueuedCommand {
        QueuedCommand::new(CorrelationId::from(name), Message::new(Category::Architect, name))
    }

    #[test]
    fn test_fifo() {
        let queue = OutboundQueue::unbounded();
        for name in ["a", "b", "c"] {
            assert_ok!(queue.enqueue(command(name)));
        }
        let order: Vec<String> = std::iter::from_fn(|| queue.try_next())
            .map(|item| item.command.kind)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_bounded_rejects_when_full() {
        let queue = OutboundQueue::new(Some(2));
        assert_ok!(queue.enqueue(command("a")));
        assert_ok!(queue.enqueue(command("b")));
        let err = assert_err!(queue.enqueue(command("c")));
        assert_eq!(err.kind(), ErrorKind::QueueFull);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_requeue_goes_to_tail_and_caps_attempts() {
        let queue = OutboundQueue::new(Some(1));
        assert_ok!(queue.enqueue(command("a")));
        let a = queue.try_next().unwrap();
        assert_ok!(queue.enqueue(command("b")));

        // retries bypass the capacity bound
        assert!(queue.requeue(a, 3).is_none());
        assert_eq!(queue.try_next().unwrap().command.kind, "b");

        let a = queue.try_next().unwrap();
        assert_eq!(a.attempts, 1);
        assert!(queue.requeue(a, 3).is_none());
        let a = queue.try_next().unwrap();
        let dropped = queue.requeue(a, 3).unwrap();
        assert_eq!(dropped.attempts, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_restore_keeps_head_and_attempts() {
        let queue = OutboundQueue::unbounded();
        assert_ok!(queue.enqueue(command("a")));
        assert_ok!(queue.enqueue(command("b")));

        let a = queue.try_next().unwrap();
        queue.restore(a);
        let a = queue.try_next().unwrap();
        assert_eq!(a.command.kind, "a");
        assert_eq!(a.attempts, 0);
    }

    #[tokio::test]
    async fn test_next_waits_for_enqueue() {
        let queue = Arc::new(OutboundQueue::unbounded());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        assert!(!consumer.is_finished());

        assert_ok!(queue.enqueue(command("late")));
        assert_eq!(consumer.await.unwrap().command.kind, "late");
    }
}
