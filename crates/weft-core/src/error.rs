use thiserror::Error;

use crate::types::{ChannelName, StageId};

/// Configuration faults detected while building a pipeline graph.
///
/// Every variant is fatal: a pipeline that fails validation never starts.
#[derive(Error, Debug)]
pub enum WiringError {
    #[error("duplicate stage id `{0}`")]
    DuplicateStage(StageId),

    #[error("channel `{0}` is consumed but has no producer")]
    MissingProducer(ChannelName),

    #[error("channel `{channel}` has {count} producers, expected exactly one")]
    DuplicateProducer { channel: ChannelName, count: usize },

    #[error("channel `{channel}` is consumed by {count} stages, fan-out is not supported")]
    FanOut { channel: ChannelName, count: usize },

    #[error("channel `{0}` is produced but never consumed")]
    UnconsumedChannel(ChannelName),

    #[error("stage `{0}` is not connected to the graph")]
    IsolatedStage(StageId),

    #[error("cycle detected through stage `{0}`")]
    Cycle(StageId),

    #[error("pipeline has no stages")]
    Empty,
}

/// Reason attached to a negative acknowledgment.
///
/// Processing failures never escape the stage boundary as panics or stream
/// errors; they travel upstream as one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("stage `{stage}` failed: {message}")]
    Stage { stage: StageId, message: String },

    #[error("stage `{stage}` received a payload that is not a `{expected}`")]
    PayloadType {
        stage: StageId,
        expected: &'static str,
    },

    #[error("transport rejected delivery: {message}")]
    Transport { message: String },
}

impl ProcessingError {
    /// Wrap a user-logic failure observed in `stage`.
    pub fn in_stage(stage: &StageId, source: impl std::fmt::Display) -> Self {
        Self::Stage {
            stage: stage.clone(),
            message: source.to_string(),
        }
    }

    /// A transport-level rejection reported by a broker adapter.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}
