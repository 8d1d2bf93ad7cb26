use std::collections::VecDeque;

use shared::{
    domain::DeviceId,
    protocol::{Envelope, LinkMessage},
};
use tracing::{debug, warn};

/// Device-side send buffer for one link.
///
/// Messages wait in `unsent` until a connection is available and are stamped
/// with the next envelope sequence at send time. Stamped envelopes stay in
/// `unconfirmed` until a backend heartbeat echo reports them received, so they
/// can be retransmitted after a reconnect. Heartbeats and hellos are stamped
/// but never retained.
pub struct Outbox {
    device_id: DeviceId,
    capacity: usize,
    next_sequence: u64,
    unconfirmed: VecDeque<Envelope>,
    unsent: VecDeque<LinkMessage>,
}

impl Outbox {
    pub fn new(device_id: DeviceId, capacity: usize) -> Self {
        Self {
            device_id,
            capacity: capacity.max(1),
            next_sequence: 1,
            unconfirmed: VecDeque::new(),
            unsent: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.unconfirmed.len() + self.unsent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues a message. When over capacity the oldest buffered state event is
    /// shed and returned; acks are kept even if that leaves the outbox over
    /// capacity.
    pub fn push(&mut self, message: LinkMessage) -> Option<LinkMessage> {
        self.unsent.push_back(message);
        if self.len() <= self.capacity {
            return None;
        }

        let dropped = if let Some(index) = self
            .unconfirmed
            .iter()
            .position(|envelope| envelope.message.is_droppable())
        {
            self.unconfirmed
                .remove(index)
                .map(|envelope| envelope.message)
        } else if let Some(index) = self.unsent.iter().position(LinkMessage::is_droppable) {
            self.unsent.remove(index)
        } else {
            None
        };

        match &dropped {
            Some(message) => debug!(
                device_id = %self.device_id,
                kind = message.kind(),
                "link: outbox full, dropped oldest state event"
            ),
            None => warn!(
                device_id = %self.device_id,
                buffered = self.len(),
                capacity = self.capacity,
                "link: outbox over capacity with nothing droppable"
            ),
        }
        dropped
    }

    /// Wraps a message in the next envelope without retaining it.
    pub fn stamp(&mut self, message: LinkMessage) -> Envelope {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Envelope::new(self.device_id.clone(), sequence, message)
    }

    /// Stamps everything waiting and keeps copies until confirmed.
    pub fn take_unsent(&mut self) -> Vec<Envelope> {
        let mut stamped = Vec::with_capacity(self.unsent.len());
        while let Some(message) = self.unsent.pop_front() {
            let envelope = self.stamp(message);
            self.unconfirmed.push_back(envelope.clone());
            stamped.push(envelope);
        }
        stamped
    }

    /// Envelopes sent on an earlier connection that were never confirmed, in
    /// their original order and with their original sequence numbers.
    pub fn retransmits(&self) -> Vec<Envelope> {
        self.unconfirmed.iter().cloned().collect()
    }

    pub fn confirm_through(&mut self, sequence: u64) {
        while self
            .unconfirmed
            .front()
            .is_some_and(|envelope| envelope.sequence_number <= sequence)
        {
            self.unconfirmed.pop_front();
        }
    }
}

#[cfg(test)]
#[path = "tests/outbox_tests.rs"]
mod tests;
