use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::warn;

use crate::ack::AckStrategy;
use crate::adapter::{InboundAdapter, OutboundAdapter};
use crate::envelope::Envelope;
use crate::error::ProcessingError;
use crate::metrics::PipelineMetrics;
use crate::types::{AnyPayload, ChannelName, StageId};

pub(crate) type PayloadTransform =
    Box<dyn Fn(AnyPayload) -> Result<AnyPayload, ProcessingError> + Send + Sync>;
pub(crate) type EnvelopeTransform = Box<
    dyn Fn(Envelope<AnyPayload>) -> BoxFuture<'static, Result<Envelope<AnyPayload>, ProcessingError>>
        + Send
        + Sync,
>;
pub(crate) type PayloadConsumer =
    Box<dyn Fn(AnyPayload) -> Result<(), ProcessingError> + Send + Sync>;
pub(crate) type EnvelopeConsumer = Box<
    dyn Fn(Envelope<AnyPayload>) -> BoxFuture<'static, Result<(), ProcessingError>> + Send + Sync,
>;

/// The shape of a stage's logic, fixed when the graph is built.
///
/// Payload shapes are wrapped by the acknowledgment engine; envelope shapes
/// bypass it. Adapters terminate a path at the broker boundary.
pub(crate) enum StageLogic {
    /// Source: drains an inbound adapter onto the outbound channel.
    Inbound(Arc<dyn InboundAdapter>),
    /// Processor over raw payloads; metadata is inherited and settlement is
    /// delegated according to the stage strategy.
    Transform(PayloadTransform),
    /// Processor over full envelopes; settlement is the logic's business.
    TransformEnvelope(EnvelopeTransform),
    /// Terminal consumer of raw payloads.
    Sink(PayloadConsumer),
    /// Terminal consumer of full envelopes.
    SinkEnvelope(EnvelopeConsumer),
    /// Terminal: hands envelopes to an outbound adapter, which owns
    /// settlement per transport outcome.
    Outbound(Arc<dyn OutboundAdapter>),
}

impl StageLogic {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            StageLogic::Inbound(_) => "inbound-adapter",
            StageLogic::Transform(_) => "payload-processor",
            StageLogic::TransformEnvelope(_) => "envelope-processor",
            StageLogic::Sink(_) => "payload-sink",
            StageLogic::SinkEnvelope(_) => "envelope-sink",
            StageLogic::Outbound(_) => "outbound-adapter",
        }
    }
}

/// One named processing step: its connection points, acknowledgment strategy
/// and logic. Descriptors are built once and never mutated.
pub struct StageDescriptor {
    pub(crate) id: StageId,
    pub(crate) inbound: Option<ChannelName>,
    pub(crate) outbound: Option<ChannelName>,
    pub(crate) strategy: AckStrategy,
    pub(crate) logic: StageLogic,
}

impl StageDescriptor {
    pub fn id(&self) -> &StageId {
        &self.id
    }

    pub fn inbound(&self) -> Option<&ChannelName> {
        self.inbound.as_ref()
    }

    pub fn outbound(&self) -> Option<&ChannelName> {
        self.outbound.as_ref()
    }

    pub fn strategy(&self) -> AckStrategy {
        self.strategy
    }

    /// Apply this stage to one inbound envelope, returning the envelope to
    /// forward downstream, if any.
    ///
    /// A user-logic failure negatively acknowledges the inbound envelope and
    /// forwards nothing; the failure never escapes as a fault.
    pub(crate) async fn process(
        &self,
        envelope: Envelope<AnyPayload>,
        metrics: &PipelineMetrics,
    ) -> Option<Envelope<AnyPayload>> {
        match &self.logic {
            // Sources are driven by the runtime loop, not per-envelope.
            StageLogic::Inbound(_) => Some(envelope),

            StageLogic::Transform(transform) => {
                let settlement = Arc::clone(envelope.settlement());
                self.strategy.settle_before(&settlement).await;

                let id = envelope.id();
                let (payload, metadata, _) = envelope.into_parts();
                match transform(payload) {
                    Ok(outbound) => {
                        let outbound = Envelope::from_parts(
                            id,
                            outbound,
                            metadata,
                            Arc::clone(&settlement),
                        );
                        Some(self.strategy.bind_outbound(&settlement, outbound))
                    }
                    Err(reason) => {
                        warn!(
                            stage = %self.id,
                            envelope_id = %id,
                            error = %reason,
                            "stage logic failed, envelope nacked"
                        );
                        metrics.record_failure();
                        settlement.nack(reason).await;
                        None
                    }
                }
            }

            StageLogic::TransformEnvelope(transform) => {
                let settlement = Arc::clone(envelope.settlement());
                let id = envelope.id();
                match transform(envelope).await {
                    Ok(outbound) => Some(outbound),
                    Err(reason) => {
                        warn!(
                            stage = %self.id,
                            envelope_id = %id,
                            error = %reason,
                            "stage logic failed, envelope nacked"
                        );
                        metrics.record_failure();
                        settlement.nack(reason).await;
                        None
                    }
                }
            }

            StageLogic::Sink(consume) => {
                let settlement = Arc::clone(envelope.settlement());
                self.strategy.settle_before(&settlement).await;

                let id = envelope.id();
                let (payload, _, _) = envelope.into_parts();
                match consume(payload) {
                    Ok(()) => {
                        if self.strategy == AckStrategy::PostProcessing {
                            settlement.ack().await;
                        }
                        metrics.record_delivered();
                    }
                    Err(reason) => {
                        warn!(
                            stage = %self.id,
                            envelope_id = %id,
                            error = %reason,
                            "sink logic failed, envelope nacked"
                        );
                        metrics.record_failure();
                        settlement.nack(reason).await;
                    }
                }
                None
            }

            StageLogic::SinkEnvelope(consume) => {
                let settlement = Arc::clone(envelope.settlement());
                let id = envelope.id();
                match consume(envelope).await {
                    Ok(()) => metrics.record_delivered(),
                    Err(reason) => {
                        warn!(
                            stage = %self.id,
                            envelope_id = %id,
                            error = %reason,
                            "sink logic failed, envelope nacked"
                        );
                        metrics.record_failure();
                        settlement.nack(reason).await;
                    }
                }
                None
            }

            StageLogic::Outbound(adapter) => {
                adapter.send(envelope).await;
                metrics.record_delivered();
                None
            }
        }
    }
}

impl std::fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("id", &self.id)
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .field("strategy", &self.strategy)
            .field("kind", &self.logic.kind())
            .finish()
    }
}
