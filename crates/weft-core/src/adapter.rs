use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::types::AnyPayload;

/// Inbound half of the broker boundary: produces envelopes for a source
/// stage from wire messages.
///
/// Implementations bind each envelope's settlement handlers to the
/// underlying transport message, so acknowledging the envelope settles the
/// wire message (commit vs. release/redeliver). Returning `None` signals end
/// of stream and shuts the pipeline path down cleanly.
#[async_trait]
pub trait InboundAdapter: Send + Sync {
    async fn receive(&self) -> Option<Envelope<AnyPayload>>;
}

/// Outbound half of the broker boundary: consumes envelopes at a sink stage.
///
/// Implementations translate the metadata kinds they understand (e.g.
/// subject, application properties, address) into wire-level attributes and
/// own the envelope's settlement: acknowledge on transport-confirmed
/// delivery, negatively acknowledge with a transport reason on rejection.
/// Retry and redelivery policy live behind this boundary, never in the
/// engine.
#[async_trait]
pub trait OutboundAdapter: Send + Sync {
    async fn send(&self, envelope: Envelope<AnyPayload>);
}
