use std::fmt;

use ferry_common::{Envelope, EnvelopeId};
use url::Url;

/// An ordered group of envelopes for one destination
///
/// Only exists inside the sending pipeline; never persisted.
#[derive(Debug, Clone)]
pub struct OutgoingMessageBatch {
    pub destination: Url,
    pub envelopes: Vec<Envelope>,
}

impl OutgoingMessageBatch {
    #[must_use]
    pub const fn new(destination: Url, envelopes: Vec<Envelope>) -> Self {
        Self {
            destination,
            envelopes,
        }
    }

    #[must_use]
    pub fn single(destination: Url, envelope: Envelope) -> Self {
        Self::new(destination, vec![envelope])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = EnvelopeId> + '_ {
        self.envelopes.iter().map(|e| e.id)
    }
}

impl fmt::Display for OutgoingMessageBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} envelope(s) to {}", self.len(), self.destination)
    }
}
