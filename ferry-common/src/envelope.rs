//! The envelope: a message plus everything needed to deliver it.

use std::{any::Any, sync::Arc};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{EnvelopeId, OwnerId, SerializationError, Serializer};

/// An in-memory message value waiting to be serialized
pub type MessagePayload = Arc<dyn Any + Send + Sync>;

/// Delivery state of a persisted envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeStatus {
    /// Received and waiting to be handled
    #[default]
    Incoming,
    /// Waiting for its scheduled time before becoming `Incoming`
    Scheduled,
    /// Accepted for sending but not yet acknowledged by the destination
    Outgoing,
    /// Handled, retained until `keep_until`
    Handled,
}

/// How the store scopes envelope uniqueness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageIdentity {
    /// The envelope id alone is unique
    #[default]
    IdOnly,
    /// The same id may be received once per receiving address
    IdAndDestination,
}

/// Key the store enforces uniqueness on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub id: EnvelopeId,
    pub destination: Option<String>,
}

/// The unit of delivery
///
/// Only the fields that survive serialization are persisted. The in-memory
/// `message` and its `serializer` exist purely so the sending pipeline can
/// lazily produce `data` right before transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,

    /// Name of the message type carried in `data`
    pub message_type: Option<String>,
    /// Raw serialized body
    pub data: Option<Arc<[u8]>>,
    pub content_type: Option<String>,
    /// Interop metadata
    #[serde(default)]
    pub headers: AHashMap<String, String>,

    pub status: EnvelopeStatus,
    pub owner_id: OwnerId,
    pub attempts: u32,
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Expiration. An envelope past this time is never delivered.
    pub deliver_by: Option<DateTime<Utc>>,
    /// Retention for handled envelopes
    pub keep_until: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,

    pub destination: Option<Url>,
    pub reply_uri: Option<Url>,
    /// Listener address the envelope was received at
    pub received_at: Option<Url>,
    /// Name of the sending service
    pub source: Option<String>,
    pub tenant_id: Option<String>,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
    pub correlation_id: Option<String>,
    pub conversation_id: Option<EnvelopeId>,
    /// Envelope whose handling caused this one
    pub parent_id: Option<EnvelopeId>,

    #[serde(skip)]
    pub message: Option<MessagePayload>,
    #[serde(skip)]
    pub serializer: Option<Arc<dyn Serializer>>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            id: EnvelopeId::generate(),
            message_type: None,
            data: None,
            content_type: None,
            headers: AHashMap::new(),
            status: EnvelopeStatus::default(),
            owner_id: OwnerId::ANY,
            attempts: 0,
            scheduled_time: None,
            deliver_by: None,
            keep_until: None,
            sent_at: Utc::now(),
            destination: None,
            reply_uri: None,
            received_at: None,
            source: None,
            tenant_id: None,
            group_id: None,
            deduplication_id: None,
            correlation_id: None,
            conversation_id: None,
            parent_id: None,
            message: None,
            serializer: None,
        }
    }
}

impl Envelope {
    /// Create an outgoing envelope for `destination`
    #[must_use]
    pub fn outgoing(destination: Url) -> Self {
        Self {
            status: EnvelopeStatus::Outgoing,
            destination: Some(destination),
            ..Self::default()
        }
    }

    /// Create an incoming envelope received at `address`
    #[must_use]
    pub fn incoming(address: Url) -> Self {
        Self {
            status: EnvelopeStatus::Incoming,
            received_at: Some(address.clone()),
            destination: Some(address),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<EnvelopeId>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach an already serialized body
    #[must_use]
    pub fn with_data(mut self, message_type: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        self.message_type = Some(message_type.into());
        self.data = Some(data.into());
        self
    }

    /// Attach a message value and the serializer that will write it
    #[must_use]
    pub fn with_message(
        mut self,
        message_type: impl Into<String>,
        message: MessagePayload,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        self.message_type = Some(message_type.into());
        self.message = Some(message);
        self.serializer = Some(serializer);
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn scheduled_at(mut self, time: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(time);
        self
    }

    #[must_use]
    pub const fn deliver_by(mut self, time: DateTime<Utc>) -> Self {
        self.deliver_by = Some(time);
        self
    }

    /// Uniqueness key for the given identity mode
    #[must_use]
    pub fn identity(&self, mode: MessageIdentity) -> IdentityKey {
        IdentityKey {
            id: self.id,
            destination: match mode {
                MessageIdentity::IdOnly => None,
                MessageIdentity::IdAndDestination => self
                    .received_at
                    .as_ref()
                    .or(self.destination.as_ref())
                    .map(ToString::to_string),
            },
        }
    }

    /// Whether `deliver_by` has passed
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deliver_by.is_some_and(|deadline| deadline <= now)
    }

    /// Whether the envelope should wait for its scheduled time
    #[must_use]
    pub fn is_scheduled_for_later(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time.is_some_and(|time| time > now)
    }

    /// Produce `data` from the attached message if it is not already present
    ///
    /// # Errors
    ///
    /// Fails when there is no body and no serializer, or when the serializer
    /// rejects the message.
    pub fn ensure_data(&mut self) -> Result<(), SerializationError> {
        if self.data.is_some() {
            return Ok(());
        }

        let serializer = self
            .serializer
            .clone()
            .ok_or(SerializationError::NoSerializer(self.id))?;

        if self.message.is_none() {
            return Err(SerializationError::MissingMessage(self.id));
        }

        let bytes = serializer.write(self)?;
        self.data = Some(Arc::from(bytes));
        if self.content_type.is_none() {
            self.content_type = Some(serializer.content_type().to_string());
        }

        Ok(())
    }

    /// Encode the persisted part of the envelope
    ///
    /// # Errors
    ///
    /// Returns an error if bincode cannot encode the envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    /// Decode an envelope previously written by [`Envelope::to_bytes`]
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoded envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        let (envelope, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::BincodeSerializer;

    fn queue(name: &str) -> Url {
        Url::parse(&format!("queue://{name}")).expect("valid url")
    }

    #[test]
    fn persisted_fields_survive_encoding() {
        let envelope = Envelope::outgoing(queue("orders"))
            .with_id(42u128)
            .with_data("OrderPlaced", b"{}".as_slice())
            .with_header("tenant", "acme");

        let decoded = Envelope::from_bytes(&envelope.to_bytes().expect("encode")).expect("decode");

        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.status, EnvelopeStatus::Outgoing);
        assert_eq!(decoded.destination, envelope.destination);
        assert_eq!(decoded.data.as_deref(), Some(b"{}".as_slice()));
        assert_eq!(decoded.headers.get("tenant").map(String::as_str), Some("acme"));
        assert!(decoded.message.is_none());
    }

    #[test]
    fn identity_scoping() {
        let envelope = Envelope::incoming(queue("a")).with_id(1u128);

        assert_eq!(envelope.identity(MessageIdentity::IdOnly).destination, None);
        assert_eq!(
            envelope
                .identity(MessageIdentity::IdAndDestination)
                .destination
                .as_deref(),
            Some("queue://a")
        );

        // A job parked at another address does not collide with the delivery
        let mut parked = Envelope::outgoing(queue("a")).with_id(1u128);
        parked.received_at = Some(queue("parked"));
        assert_ne!(
            parked.identity(MessageIdentity::IdAndDestination),
            envelope.identity(MessageIdentity::IdAndDestination)
        );
    }

    #[test]
    fn expiry_and_scheduling() {
        let now = Utc::now();
        let envelope = Envelope::outgoing(queue("x"))
            .deliver_by(now - Duration::seconds(1))
            .scheduled_at(now + Duration::hours(1));

        assert!(envelope.is_expired(now));
        assert!(envelope.is_scheduled_for_later(now));
        assert!(!envelope.is_scheduled_for_later(now + Duration::hours(2)));
    }

    #[test]
    fn ensure_data_uses_serializer() {
        let serializer: Arc<dyn Serializer> = Arc::new(BincodeSerializer::<String>::new());
        let mut envelope = Envelope::outgoing(queue("x")).with_message(
            "Greeting",
            Arc::new("hello".to_string()),
            serializer,
        );

        envelope.ensure_data().expect("serializes");

        assert!(envelope.data.is_some());
        assert_eq!(
            envelope.content_type.as_deref(),
            Some(BincodeSerializer::<String>::CONTENT_TYPE)
        );
    }

    #[test]
    fn ensure_data_without_serializer_fails() {
        let mut envelope = Envelope::outgoing(queue("x"));
        assert!(matches!(
            envelope.ensure_data(),
            Err(SerializationError::NoSerializer(_))
        ));
    }
}
