//! Scripted transport for agent tests

#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use ferry_common::{Envelope, EnvelopeId};
use ferry_delivery::{DeliveryError, SendError, Sender, SenderFactory};
use parking_lot::Mutex;
use url::Url;

/// Fails the first `failures` sends, then accepts everything
#[derive(Debug)]
pub struct ScriptedSender {
    destination: Url,
    failures: AtomicUsize,
    available: AtomicBool,
    attempts: AtomicUsize,
    pings: AtomicUsize,
    delivered: Mutex<Vec<EnvelopeId>>,
}

impl ScriptedSender {
    pub fn new(destination: Url, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            destination,
            failures: AtomicUsize::new(failures),
            available: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    /// Make pings report the destination as down until [`Self::recover`]
    pub fn go_down(&self) {
        self.available.store(false, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.available.store(true, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<EnvelopeId> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl Sender for ScriptedSender {
    fn destination(&self) -> &Url {
        &self.destination
    }

    async fn ping(&self) -> Result<bool, SendError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(self.available.load(Ordering::SeqCst) && self.failures.load(Ordering::SeqCst) == 0)
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SendError::Transient("broker unavailable".into()));
        }

        self.delivered.lock().push(envelope.id);
        Ok(())
    }
}

/// Hands out the same scripted sender for every destination of a scheme
#[derive(Debug)]
pub struct ScriptedFactory {
    pub scheme: String,
    pub failures: usize,
    pub created: Mutex<Vec<Arc<ScriptedSender>>>,
}

impl ScriptedFactory {
    pub fn new(scheme: &str, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            scheme: scheme.to_string(),
            failures,
            created: Mutex::new(Vec::new()),
        })
    }
}

impl SenderFactory for ScriptedFactory {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn create(&self, destination: &Url) -> Result<Arc<dyn Sender>, DeliveryError> {
        let sender = ScriptedSender::new(destination.clone(), self.failures);
        self.created.lock().push(sender.clone());
        Ok(sender)
    }
}

pub fn queue(name: &str) -> Url {
    Url::parse(&format!("queue://{name}")).expect("valid url")
}

pub fn envelope(destination: &Url, id: u128) -> Envelope {
    Envelope::outgoing(destination.clone())
        .with_id(id)
        .with_data("Ping", b"payload".as_slice())
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}
