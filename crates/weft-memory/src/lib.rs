//! In-memory broker adapter for the Weft pipeline engine.
//!
//! Stands in for a wire transport in tests and embedded deployments:
//! [`MemorySource`] feeds envelopes into a source stage, [`MemorySink`]
//! captures what a terminal stage would have published, translating the
//! metadata kinds a broker understands into [`WireMessage`] attributes.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

use weft_core::{AnyPayload, Envelope, InboundAdapter, OutboundAdapter, ProcessingError};

/// Metadata kinds the in-memory transport understands.
pub mod kinds {
    /// Message subject.
    pub const SUBJECT: &str = "subject";
    /// Free-form application properties, a JSON object.
    pub const APPLICATION_PROPERTIES: &str = "application-properties";
    /// Destination address; overrides the sink's configured default.
    pub const ADDRESS: &str = "address";
}

/// Push handle for a [`MemorySource`]. Dropping every handle ends the
/// stream, which shuts the pipeline path down cleanly.
#[derive(Clone)]
pub struct MemorySourceHandle {
    tx: mpsc::Sender<Envelope<AnyPayload>>,
}

impl MemorySourceHandle {
    /// Emit a bare payload wrapped in a detached envelope.
    pub async fn emit<T: Send + Sync + 'static>(&self, payload: T) {
        self.emit_envelope(Envelope::new(payload).erase()).await;
    }

    /// Emit a prepared envelope, settlement handlers and all.
    pub async fn emit_envelope(&self, envelope: Envelope<AnyPayload>) {
        if self.tx.send(envelope).await.is_err() {
            warn!("memory source closed, envelope dropped");
        }
    }
}

/// Inbound adapter producing envelopes from an in-process queue.
pub struct MemorySource {
    rx: Mutex<mpsc::Receiver<Envelope<AnyPayload>>>,
}

impl MemorySource {
    /// An open source plus the handle that feeds it.
    pub fn channel(capacity: usize) -> (MemorySourceHandle, MemorySource) {
        let (tx, rx) = mpsc::channel(capacity);
        (MemorySourceHandle { tx }, MemorySource { rx: Mutex::new(rx) })
    }

    /// A source pre-filled with `envelopes`, already at end of stream.
    pub fn of_envelopes(envelopes: impl IntoIterator<Item = Envelope<AnyPayload>>) -> MemorySource {
        let envelopes: Vec<_> = envelopes.into_iter().collect();
        let (handle, source) = Self::channel(envelopes.len().max(1));
        for envelope in envelopes {
            // Capacity covers every element; the channel cannot be full.
            if handle.tx.try_send(envelope).is_err() {
                warn!("memory source overflow, envelope dropped");
            }
        }
        source
    }

    /// A source pre-filled with bare payloads in detached envelopes.
    pub fn of_payloads<T: Send + Sync + 'static>(
        payloads: impl IntoIterator<Item = T>,
    ) -> MemorySource {
        Self::of_envelopes(
            payloads
                .into_iter()
                .map(|payload| Envelope::new(payload).erase()),
        )
    }
}

#[async_trait]
impl InboundAdapter for MemorySource {
    async fn receive(&self) -> Option<Envelope<AnyPayload>> {
        self.rx.lock().await.recv().await
    }
}

/// A message as the in-memory transport would put it on the wire.
#[derive(Clone)]
pub struct WireMessage {
    pub address: String,
    pub subject: Option<String>,
    pub application_properties: serde_json::Map<String, Value>,
    body: Arc<dyn Any + Send + Sync>,
}

impl WireMessage {
    pub fn body_as<T: 'static>(&self) -> Option<&T> {
        self.body.downcast_ref()
    }
}

impl std::fmt::Debug for WireMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireMessage")
            .field("address", &self.address)
            .field("subject", &self.subject)
            .field("application_properties", &self.application_properties)
            .finish_non_exhaustive()
    }
}

/// Outbound adapter capturing published messages in memory.
///
/// Translates the [`kinds`] it understands into wire attributes. The
/// destination address is resolved envelope-first: `address` metadata wins
/// over the configured default; a message with neither is rejected. Accepted
/// envelopes are acknowledged, rejected ones negatively acknowledged with a
/// transport reason.
pub struct MemorySink {
    default_address: Option<String>,
    accepting: AtomicBool,
    messages: Mutex<Vec<WireMessage>>,
    arrival: Notify,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            default_address: None,
            accepting: AtomicBool::new(true),
            messages: Mutex::new(Vec::new()),
            arrival: Notify::new(),
        }
    }

    /// A sink whose messages fall back to `address` when the envelope
    /// carries no `address` metadata.
    pub fn with_default_address(address: impl Into<String>) -> Self {
        Self {
            default_address: Some(address.into()),
            ..Self::new()
        }
    }

    /// Toggle transport-level rejection of every subsequent delivery.
    pub fn reject_deliveries(&self, reject: bool) {
        self.accepting.store(!reject, Ordering::SeqCst);
    }

    pub async fn count(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn messages(&self) -> Vec<WireMessage> {
        self.messages.lock().await.clone()
    }

    /// Wait until at least `count` messages have been captured.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let arrived = self.arrival.notified();
            if self.messages.lock().await.len() >= count {
                return;
            }
            arrived.await;
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboundAdapter for MemorySink {
    async fn send(&self, envelope: Envelope<AnyPayload>) {
        if !self.accepting.load(Ordering::SeqCst) {
            envelope
                .nack(ProcessingError::transport("delivery rejected"))
                .await;
            return;
        }

        let id = envelope.id();
        let (body, metadata, settlement) = envelope.into_parts();

        let address = metadata
            .get(kinds::ADDRESS)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| self.default_address.clone());
        let Some(address) = address else {
            settlement
                .nack(ProcessingError::transport(
                    "no address for outbound message",
                ))
                .await;
            return;
        };

        let subject = metadata
            .get(kinds::SUBJECT)
            .and_then(Value::as_str)
            .map(str::to_owned);
        let application_properties = metadata
            .get(kinds::APPLICATION_PROPERTIES)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        self.messages.lock().await.push(WireMessage {
            address: address.clone(),
            subject,
            application_properties,
            body: Arc::from(body),
        });
        self.arrival.notify_waiters();

        debug!(envelope_id = %id, address = %address, "message captured");
        settlement.ack().await;
    }
}
