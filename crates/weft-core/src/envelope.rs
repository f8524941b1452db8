use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use uuid::Uuid;

use crate::ack::{AckHandler, NackHandler, Settlement, SettlementState};
use crate::error::ProcessingError;
use crate::metadata::{Metadata, MetadataItem};
use crate::types::AnyPayload;

/// The unit of data flowing through a pipeline: a payload, an ordered
/// metadata collection and a settlement contract.
///
/// Envelopes are immutable; every `with_*` operation is a pure value
/// transformation producing a new envelope. Derived envelopes share the
/// original's [`Settlement`], so acknowledging any of them settles the one
/// logical message they all descend from. Only [`ack`](Self::ack) and
/// [`nack`](Self::nack) have externally observable effects.
pub struct Envelope<T> {
    id: Uuid,
    payload: T,
    metadata: Metadata,
    settlement: Arc<Settlement>,
}

impl<T> Envelope<T> {
    /// Wrap a payload with empty metadata and a detached settlement.
    pub fn new(payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            metadata: Metadata::new(),
            settlement: Settlement::detached(),
        }
    }

    /// Start building an envelope with metadata and settlement handlers.
    pub fn builder(payload: T) -> EnvelopeBuilder<T> {
        EnvelopeBuilder {
            payload,
            metadata: Metadata::new(),
            ack: None,
            nack: None,
        }
    }

    /// Identifier of the logical message, carried through derivations.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn settlement(&self) -> &Arc<Settlement> {
        &self.settlement
    }

    pub fn state(&self) -> SettlementState {
        self.settlement.state()
    }

    /// Split the envelope into payload, metadata and settlement.
    pub fn into_parts(self) -> (T, Metadata, Arc<Settlement>) {
        (self.payload, self.metadata, self.settlement)
    }

    /// Derive an envelope with a different payload, keeping metadata and
    /// delegating settlement to this envelope's logical message.
    pub fn with_payload<U>(self, payload: U) -> Envelope<U> {
        Envelope {
            id: self.id,
            payload,
            metadata: self.metadata,
            settlement: self.settlement,
        }
    }

    /// Derive an envelope with `item` merged into the metadata, replacing any
    /// existing item of the same kind.
    pub fn with_metadata(mut self, item: MetadataItem) -> Self {
        self.metadata.insert(item);
        self
    }

    /// Derive an envelope whose ack handler is replaced; nack still delegates
    /// to this envelope's settlement.
    ///
    /// Reserved for acknowledgment-strategy plumbing and broker adapters.
    /// Ordinary transformation logic derives envelopes with
    /// [`with_payload`](Self::with_payload) / [`with_metadata`](Self::with_metadata)
    /// so settlement delegation stays intact.
    pub fn with_ack<F, Fut>(self, ack: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delegate = Arc::clone(&self.settlement);
        let settlement = Settlement::new(ack, move |reason| async move {
            delegate.nack(reason).await;
        });
        self.replace_settlement(settlement)
    }

    /// Derive an envelope whose nack handler is replaced; ack still delegates
    /// to this envelope's settlement.
    pub fn with_nack<F, Fut>(self, nack: F) -> Self
    where
        F: FnOnce(ProcessingError) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delegate = Arc::clone(&self.settlement);
        let settlement = Settlement::new(
            move || async move {
                delegate.ack().await;
            },
            nack,
        );
        self.replace_settlement(settlement)
    }

    /// Signal successful processing of the logical message. Idempotent.
    pub async fn ack(&self) {
        self.settlement.ack().await;
    }

    /// Signal failed processing of the logical message. Idempotent.
    pub async fn nack(&self, reason: ProcessingError) {
        self.settlement.nack(reason).await;
    }

    pub(crate) fn replace_settlement(self, settlement: Arc<Settlement>) -> Self {
        Self { settlement, ..self }
    }

    pub(crate) fn from_parts(
        id: Uuid,
        payload: T,
        metadata: Metadata,
        settlement: Arc<Settlement>,
    ) -> Self {
        Self {
            id,
            payload,
            metadata,
            settlement,
        }
    }
}

impl<T: Send + Sync + 'static> Envelope<T> {
    /// Erase the payload type for transport across graph edges.
    pub fn erase(self) -> Envelope<AnyPayload> {
        Envelope {
            id: self.id,
            payload: Box::new(self.payload),
            metadata: self.metadata,
            settlement: self.settlement,
        }
    }
}

impl Envelope<AnyPayload> {
    /// Recover the typed envelope, or give the erased one back on mismatch.
    pub fn downcast<T: Send + Sync + 'static>(self) -> Result<Envelope<T>, Envelope<AnyPayload>> {
        let Self {
            id,
            payload,
            metadata,
            settlement,
        } = self;
        match payload.downcast::<T>() {
            Ok(payload) => Ok(Envelope {
                id,
                payload: *payload,
                metadata,
                settlement,
            }),
            Err(payload) => Err(Envelope {
                id,
                payload,
                metadata,
                settlement,
            }),
        }
    }
}

impl<T> std::fmt::Debug for Envelope<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.id)
            .field("metadata", &self.metadata)
            .field("state", &self.settlement.state())
            .finish_non_exhaustive()
    }
}

/// Builder for envelopes carrying metadata and settlement handlers, the way
/// broker adapters and envelope-shaped stage logic construct them.
pub struct EnvelopeBuilder<T> {
    payload: T,
    metadata: Metadata,
    ack: Option<AckHandler>,
    nack: Option<NackHandler>,
}

impl<T> EnvelopeBuilder<T> {
    /// Attach a metadata item, replacing any existing item of the same kind.
    pub fn metadata(mut self, kind: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(MetadataItem::new(kind, value));
        self
    }

    pub fn item(mut self, item: MetadataItem) -> Self {
        self.metadata.insert(item);
        self
    }

    pub fn on_ack<F, Fut>(mut self, ack: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ack = Some(Box::new(move || ack().boxed()));
        self
    }

    pub fn on_nack<F, Fut>(mut self, nack: F) -> Self
    where
        F: FnOnce(ProcessingError) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.nack = Some(Box::new(move |reason| nack(reason).boxed()));
        self
    }

    pub fn build(self) -> Envelope<T> {
        let ack = self.ack.unwrap_or_else(|| Box::new(|| async {}.boxed()));
        let nack = self.nack.unwrap_or_else(|| Box::new(|_| async {}.boxed()));
        Envelope {
            id: Uuid::new_v4(),
            payload: self.payload,
            metadata: self.metadata,
            settlement: Settlement::from_handlers(ack, nack),
        }
    }
}
