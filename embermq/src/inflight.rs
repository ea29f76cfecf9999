use rust_box::dequemap::DequeBTreeMap as DequeMap;

use embermq_utils::{timestamp_millis, TimestampMillis};

use crate::error::{MqttError, Result};
use crate::types::{PacketId, Publish};

#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub publish: Publish,
    pub since: TimestampMillis,
}

impl InflightMessage {
    #[inline]
    pub fn new(publish: Publish) -> Self {
        Self { publish, since: timestamp_millis() }
    }
}

/// The per-session window of QoS>0 messages sent but not yet acknowledged,
/// in send order. Bounds how much a slow subscriber can have outstanding;
/// messages beyond the window wait in the pending queue.
pub struct Inflight {
    cap: usize,
    next: PacketId,
    queues: DequeMap<PacketId, InflightMessage>,
}

impl Inflight {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.max(1), next: 1, queues: DequeMap::default() }
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.queues.len() < self.cap
    }

    /// Allocates the next free packet id, skipping 0 and ids still in use.
    #[inline]
    pub fn next_id(&mut self) -> Result<PacketId> {
        for _ in 0..u16::MAX {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if id == 0 {
                continue;
            }
            if !self.queues.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(MqttError::Msg("no packet id available".into()))
    }

    #[inline]
    pub fn push(&mut self, m: InflightMessage) {
        if let Some(id) = m.publish.packet_id {
            self.queues.insert(id, m);
        } else {
            log::warn!("in-flight message without a packet id: {:?}", m.publish);
        }
    }

    #[inline]
    pub fn ack(&mut self, packet_id: &PacketId) -> Option<InflightMessage> {
        self.queues.remove(packet_id)
    }

    #[inline]
    pub fn exist(&self, packet_id: &PacketId) -> bool {
        self.queues.contains_key(packet_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Empties the window in send order, for redelivery over a new
    /// connection.
    #[inline]
    pub fn drain(&mut self) -> Vec<InflightMessage> {
        let mut out = Vec::with_capacity(self.queues.len());
        while let Some((_, m)) = self.queues.pop_front() {
            out.push(m);
        }
        out
    }

    /// Copies the window in send order, for the persistence snapshot.
    #[inline]
    pub fn messages(&self) -> Vec<InflightMessage> {
        self.queues.iter().map(|(_, m)| m.clone()).collect()
    }
}
