use std::collections::VecDeque;

use ferry_common::Envelope;
use parking_lot::Mutex;
use tracing::warn;
use url::Url;

/// Capped FIFO of envelopes waiting to be replayed
///
/// Pushing into a full buffer drops the oldest envelope.
#[derive(Debug)]
pub struct RetryBuffer {
    destination: Url,
    capacity: usize,
    queue: Mutex<VecDeque<Envelope>>,
}

impl RetryBuffer {
    #[must_use]
    pub fn new(destination: Url, capacity: usize) -> Self {
        Self {
            destination,
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Keep `envelopes` for replay, in order
    pub fn extend(&self, envelopes: impl IntoIterator<Item = Envelope>) {
        let mut queue = self.queue.lock();
        for envelope in envelopes {
            if self.capacity == 0 {
                warn!(destination = %self.destination, envelope = %envelope.id, "Retry buffer disabled, dropping envelope");
                continue;
            }

            if queue.len() >= self.capacity {
                let dropped = queue.pop_front();
                warn!(
                    destination = %self.destination,
                    envelope = ?dropped.map(|e| e.id),
                    capacity = self.capacity,
                    "Retry buffer full, dropping oldest envelope"
                );
            }
            queue.push_back(envelope);
        }
    }

    /// Take everything buffered, oldest first
    pub fn take(&self) -> Vec<Envelope> {
        self.queue.lock().drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use ferry_common::EnvelopeId;

    use super::*;

    fn destination() -> Url {
        Url::parse("queue://x").expect("valid url")
    }

    fn envelopes(ids: std::ops::RangeInclusive<u128>) -> Vec<Envelope> {
        ids.map(|id| Envelope::outgoing(destination()).with_id(id))
            .collect()
    }

    #[test]
    fn drops_oldest_when_full() {
        let buffer = RetryBuffer::new(destination(), 3);
        buffer.extend(envelopes(1..=5));

        assert_eq!(buffer.len(), 3);
        let ids: Vec<EnvelopeId> = buffer.take().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, (3..=5u128).map(EnvelopeId::from).collect::<Vec<_>>());
        assert!(buffer.is_empty());
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let buffer = RetryBuffer::new(destination(), 0);
        buffer.extend(envelopes(1..=2));
        assert!(buffer.is_empty());
    }
}
