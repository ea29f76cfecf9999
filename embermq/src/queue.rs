use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::types::Publish;

/// What to discard when a full queue is offered another message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DropPolicy {
    /// Reject the incoming message.
    Incoming,
    /// Evict the oldest queued message to make room.
    Oldest,
}

/// A session's FIFO queue of messages awaiting a live connection or an open
/// in-flight slot. Guarded by its own mutex, which is never held across an
/// await; trie locks are never taken while it is held.
pub struct PendingQueue {
    cap: usize,
    policy: DropPolicy,
    inner: Mutex<VecDeque<Publish>>,
}

impl PendingQueue {
    #[inline]
    pub fn new(cap: usize, policy: DropPolicy) -> Self {
        Self { cap, policy, inner: Mutex::new(VecDeque::new()) }
    }

    /// Appends a message. `Ok(None)` when stored, `Ok(Some(old))` when
    /// stored at the cost of the oldest entry, `Err(msg)` when the queue is
    /// full and the policy rejects the incoming message.
    #[inline]
    pub fn push(&self, msg: Publish) -> Result<Option<Publish>, Publish> {
        let mut inner = self.inner.lock();
        if inner.len() < self.cap {
            inner.push_back(msg);
            return Ok(None);
        }
        match self.policy {
            DropPolicy::Incoming => Err(msg),
            DropPolicy::Oldest => {
                let removed = inner.pop_front();
                inner.push_back(msg);
                Ok(removed)
            }
        }
    }

    /// Returns a message to the head of the queue, e.g. when a flush could
    /// not place it. Not subject to the capacity check.
    #[inline]
    pub fn push_front(&self, msg: Publish) {
        self.inner.lock().push_front(msg);
    }

    #[inline]
    pub fn pop(&self) -> Option<Publish> {
        self.inner.lock().pop_front()
    }

    /// Deep copy of the queue contents, for the persistence snapshot.
    #[inline]
    pub fn snapshot(&self) -> Vec<Publish> {
        self.inner.lock().iter().cloned().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QoS;

    fn msg(n: u8) -> Publish {
        Publish::new("t", vec![n], QoS::AtLeastOnce)
    }

    #[test]
    fn fifo_order() {
        let q = PendingQueue::new(8, DropPolicy::Incoming);
        for n in 0..4 {
            assert!(q.push(msg(n)).is_ok());
        }
        let drained: Vec<u8> = std::iter::from_fn(|| q.pop()).map(|m| m.payload[0]).collect();
        assert_eq!(drained, vec![0, 1, 2, 3]);
    }

    #[test]
    fn full_queue_policies() {
        let q = PendingQueue::new(2, DropPolicy::Incoming);
        assert!(q.push(msg(0)).is_ok());
        assert!(q.push(msg(1)).is_ok());
        let rejected = q.push(msg(2)).unwrap_err();
        assert_eq!(rejected.payload[0], 2);
        assert_eq!(q.len(), 2);

        let q = PendingQueue::new(2, DropPolicy::Oldest);
        assert!(q.push(msg(0)).is_ok());
        assert!(q.push(msg(1)).is_ok());
        let evicted = q.push(msg(2)).unwrap().unwrap();
        assert_eq!(evicted.payload[0], 0);
        assert_eq!(q.pop().unwrap().payload[0], 1);
    }

    #[test]
    fn push_front_restores_order() {
        let q = PendingQueue::new(4, DropPolicy::Incoming);
        q.push(msg(1)).unwrap();
        let head = q.pop().unwrap();
        q.push(msg(2)).unwrap();
        q.push_front(head);
        assert_eq!(q.pop().unwrap().payload[0], 1);
        assert_eq!(q.pop().unwrap().payload[0], 2);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let q = PendingQueue::new(4, DropPolicy::Incoming);
        q.push(msg(7)).unwrap();
        let snap = q.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(q.len(), 1);
    }
}
