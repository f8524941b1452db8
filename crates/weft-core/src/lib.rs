//! Weft pipeline engine: reactive messaging over named channels.
//!
//! Envelopes (payload + ordered metadata + settlement contract) flow through
//! a directed graph of stages wired by channel-name matching. The engine
//! provides:
//! - Metadata-preserving payload transformation
//! - Per-stage acknowledgment strategies (none, pre-processing,
//!   post-processing) with sink-to-source settlement ordering
//! - Build-time wiring validation (single producer, single consumer,
//!   no cycles)
//! - A broker adapter boundary for inbound/outbound transports
//!
//! Stage logic is polymorphic over two shapes: raw payloads, which the
//! engine wraps so metadata and settlement delegation survive the hop, and
//! full envelopes, which bypass the acknowledgment engine entirely.

pub mod ack;
pub mod adapter;
pub mod envelope;
pub mod error;
pub mod graph;
pub mod metadata;
pub mod metrics;
pub mod runtime;
pub mod stage;
pub mod types;

pub use ack::{AckHandler, AckStrategy, NackHandler, Settlement, SettlementState};
pub use adapter::{InboundAdapter, OutboundAdapter};
pub use envelope::{Envelope, EnvelopeBuilder};
pub use error::{ProcessingError, WiringError};
pub use graph::{Pipeline, PipelineBuilder, TopologyEntry};
pub use metadata::{Metadata, MetadataItem};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use runtime::{PipelineConfig, RunningPipeline};
pub use stage::StageDescriptor;
pub use types::{AnyPayload, ChannelName, StageId};
