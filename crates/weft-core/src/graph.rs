use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tracing::info;

use crate::ack::AckStrategy;
use crate::adapter::{InboundAdapter, OutboundAdapter};
use crate::envelope::Envelope;
use crate::error::{ProcessingError, WiringError};
use crate::metrics::PipelineMetrics;
use crate::stage::{
    EnvelopeConsumer, EnvelopeTransform, PayloadConsumer, PayloadTransform, StageDescriptor,
    StageLogic,
};
use crate::types::{AnyPayload, ChannelName, StageId};

/// Registration API for pipeline stages.
///
/// Stages are declared explicitly against named channels; `build` resolves
/// the names into a directed graph and rejects any inconsistent wiring
/// before the pipeline can start. There is no ambient registry: everything a
/// pipeline runs is registered here.
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<StageDescriptor>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source stage draining `adapter` onto `channel`.
    pub fn inbound(
        mut self,
        id: impl Into<StageId>,
        channel: impl Into<ChannelName>,
        adapter: Arc<dyn InboundAdapter>,
    ) -> Self {
        self.stages.push(StageDescriptor {
            id: id.into(),
            inbound: None,
            outbound: Some(channel.into()),
            strategy: AckStrategy::None,
            logic: StageLogic::Inbound(adapter),
        });
        self
    }

    /// Register a terminal stage handing `channel` to `adapter`. The adapter
    /// owns settlement per transport outcome.
    pub fn outbound(
        mut self,
        id: impl Into<StageId>,
        channel: impl Into<ChannelName>,
        adapter: Arc<dyn OutboundAdapter>,
    ) -> Self {
        self.stages.push(StageDescriptor {
            id: id.into(),
            inbound: Some(channel.into()),
            outbound: None,
            strategy: AckStrategy::None,
            logic: StageLogic::Outbound(adapter),
        });
        self
    }

    /// Register a payload-shaped processor. The engine extracts the inbound
    /// payload, runs `transform`, and re-wraps the result in an envelope that
    /// inherits the inbound metadata and delegates settlement per `strategy`.
    pub fn process<I, O, F>(
        mut self,
        id: impl Into<StageId>,
        inbound: impl Into<ChannelName>,
        outbound: impl Into<ChannelName>,
        strategy: AckStrategy,
        transform: F,
    ) -> Self
    where
        I: Send + Sync + 'static,
        O: Send + Sync + 'static,
        F: Fn(I) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        let id = id.into();
        let logic = StageLogic::Transform(wrap_transform(id.clone(), transform));
        self.stages.push(StageDescriptor {
            id,
            inbound: Some(inbound.into()),
            outbound: Some(outbound.into()),
            strategy,
            logic,
        });
        self
    }

    /// Register an envelope-shaped processor. The envelope passes through
    /// untouched apart from forwarding; the acknowledgment strategy engine
    /// does not intervene, so settlement of what `transform` returns is its
    /// own business.
    pub fn process_envelopes<I, O, F, Fut>(
        mut self,
        id: impl Into<StageId>,
        inbound: impl Into<ChannelName>,
        outbound: impl Into<ChannelName>,
        transform: F,
    ) -> Self
    where
        I: Send + Sync + 'static,
        O: Send + Sync + 'static,
        F: Fn(Envelope<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Envelope<O>>> + Send + 'static,
    {
        let id = id.into();
        let logic = StageLogic::TransformEnvelope(wrap_envelope_transform(id.clone(), transform));
        self.stages.push(StageDescriptor {
            id,
            inbound: Some(inbound.into()),
            outbound: Some(outbound.into()),
            strategy: AckStrategy::None,
            logic,
        });
        self
    }

    /// Register a payload-shaped terminal consumer.
    pub fn sink<I, F>(
        mut self,
        id: impl Into<StageId>,
        inbound: impl Into<ChannelName>,
        strategy: AckStrategy,
        consume: F,
    ) -> Self
    where
        I: Send + Sync + 'static,
        F: Fn(I) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = id.into();
        let logic = StageLogic::Sink(wrap_consumer(id.clone(), consume));
        self.stages.push(StageDescriptor {
            id,
            inbound: Some(inbound.into()),
            outbound: None,
            strategy,
            logic,
        });
        self
    }

    /// Register an envelope-shaped terminal consumer; settlement is the
    /// consumer's explicit responsibility.
    pub fn sink_envelopes<I, F, Fut>(
        mut self,
        id: impl Into<StageId>,
        inbound: impl Into<ChannelName>,
        consume: F,
    ) -> Self
    where
        I: Send + Sync + 'static,
        F: Fn(Envelope<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = id.into();
        let logic = StageLogic::SinkEnvelope(wrap_envelope_consumer(id.clone(), consume));
        self.stages.push(StageDescriptor {
            id,
            inbound: Some(inbound.into()),
            outbound: None,
            strategy: AckStrategy::None,
            logic,
        });
        self
    }

    /// Resolve channel names into a directed graph.
    ///
    /// Fails fast on any configuration fault: a consumed channel without
    /// exactly one producer, fan-out, produced-but-unconsumed channels,
    /// isolated stages, duplicate stage ids, cycles.
    pub fn build(self) -> Result<Pipeline, WiringError> {
        let stages = self.stages;
        if stages.is_empty() {
            return Err(WiringError::Empty);
        }

        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.id.clone()) {
                return Err(WiringError::DuplicateStage(stage.id.clone()));
            }
            if stage.inbound.is_none() && stage.outbound.is_none() {
                return Err(WiringError::IsolatedStage(stage.id.clone()));
            }
        }

        let mut producers: BTreeMap<&ChannelName, Vec<usize>> = BTreeMap::new();
        let mut consumers: BTreeMap<&ChannelName, Vec<usize>> = BTreeMap::new();
        for (idx, stage) in stages.iter().enumerate() {
            if let Some(channel) = &stage.outbound {
                producers.entry(channel).or_default().push(idx);
            }
            if let Some(channel) = &stage.inbound {
                consumers.entry(channel).or_default().push(idx);
            }
        }

        for (channel, consuming) in &consumers {
            if consuming.len() > 1 {
                return Err(WiringError::FanOut {
                    channel: (*channel).clone(),
                    count: consuming.len(),
                });
            }
            match producers.get(channel).map(Vec::len).unwrap_or(0) {
                0 => return Err(WiringError::MissingProducer((*channel).clone())),
                1 => {}
                count => {
                    return Err(WiringError::DuplicateProducer {
                        channel: (*channel).clone(),
                        count,
                    })
                }
            }
        }

        for channel in producers.keys() {
            if !consumers.contains_key(*channel) {
                return Err(WiringError::UnconsumedChannel((*channel).clone()));
            }
        }

        let mut edges = Vec::with_capacity(consumers.len());
        for (channel, consuming) in &consumers {
            let producing = &producers[*channel];
            edges.push(Edge {
                channel: (*channel).clone(),
                producer: producing[0],
                consumer: consuming[0],
            });
        }

        detect_cycles(&stages, &edges)?;

        info!(
            stages = stages.len(),
            channels = edges.len(),
            "pipeline graph built"
        );

        Ok(Pipeline {
            stages,
            edges,
            metrics: Arc::new(PipelineMetrics::default()),
        })
    }
}

/// A resolved edge: one channel connecting its single producer to its single
/// consumer.
pub(crate) struct Edge {
    pub(crate) channel: ChannelName,
    pub(crate) producer: usize,
    pub(crate) consumer: usize,
}

/// A validated stage graph, ready to start.
///
/// The graph holds no business state; it is a lookup from channel name to
/// stage and from stage to its downstream stage.
pub struct Pipeline {
    pub(crate) stages: Vec<StageDescriptor>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Snapshot of the resolved wiring, in registration order.
    pub fn topology(&self) -> Vec<TopologyEntry> {
        self.stages
            .iter()
            .map(|stage| TopologyEntry {
                stage: stage.id.clone(),
                inbound: stage.inbound.clone(),
                outbound: stage.outbound.clone(),
                strategy: stage.strategy,
                kind: stage.logic.kind(),
            })
            .collect()
    }
}

/// One row of [`Pipeline::topology`].
#[derive(Clone, Debug, Serialize)]
pub struct TopologyEntry {
    pub stage: StageId,
    pub inbound: Option<ChannelName>,
    pub outbound: Option<ChannelName>,
    pub strategy: AckStrategy,
    pub kind: &'static str,
}

fn detect_cycles(stages: &[StageDescriptor], edges: &[Edge]) -> Result<(), WiringError> {
    let mut adjacency = vec![Vec::new(); stages.len()];
    for edge in edges {
        adjacency[edge.producer].push(edge.consumer);
    }

    // Iterative DFS, tri-color: 0 unvisited, 1 on stack, 2 done.
    let mut color = vec![0u8; stages.len()];
    for start in 0..stages.len() {
        if color[start] != 0 {
            continue;
        }
        let mut stack = vec![(start, 0usize)];
        color[start] = 1;
        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            if frame.1 < adjacency[node].len() {
                let succ = adjacency[node][frame.1];
                frame.1 += 1;
                match color[succ] {
                    0 => {
                        color[succ] = 1;
                        stack.push((succ, 0));
                    }
                    1 => return Err(WiringError::Cycle(stages[succ].id.clone())),
                    _ => {}
                }
            } else {
                color[node] = 2;
                stack.pop();
            }
        }
    }
    Ok(())
}

fn wrap_transform<I, O, F>(stage: StageId, transform: F) -> PayloadTransform
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    F: Fn(I) -> anyhow::Result<O> + Send + Sync + 'static,
{
    Box::new(move |payload: AnyPayload| {
        let input = payload
            .downcast::<I>()
            .map_err(|_| ProcessingError::PayloadType {
                stage: stage.clone(),
                expected: std::any::type_name::<I>(),
            })?;
        transform(*input)
            .map(|out| Box::new(out) as AnyPayload)
            .map_err(|err| ProcessingError::in_stage(&stage, err))
    })
}

fn wrap_envelope_transform<I, O, F, Fut>(stage: StageId, transform: F) -> EnvelopeTransform
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    F: Fn(Envelope<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Envelope<O>>> + Send + 'static,
{
    Box::new(move |envelope: Envelope<AnyPayload>| {
        let stage = stage.clone();
        match envelope.downcast::<I>() {
            Ok(typed) => {
                let output = transform(typed);
                async move {
                    output
                        .await
                        .map(|out| out.erase())
                        .map_err(|err| ProcessingError::in_stage(&stage, err))
                }
                .boxed()
            }
            Err(_) => async move {
                Err(ProcessingError::PayloadType {
                    stage,
                    expected: std::any::type_name::<I>(),
                })
            }
            .boxed(),
        }
    })
}

fn wrap_consumer<I, F>(stage: StageId, consume: F) -> PayloadConsumer
where
    I: Send + Sync + 'static,
    F: Fn(I) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Box::new(move |payload: AnyPayload| {
        let input = payload
            .downcast::<I>()
            .map_err(|_| ProcessingError::PayloadType {
                stage: stage.clone(),
                expected: std::any::type_name::<I>(),
            })?;
        consume(*input).map_err(|err| ProcessingError::in_stage(&stage, err))
    })
}

fn wrap_envelope_consumer<I, F, Fut>(stage: StageId, consume: F) -> EnvelopeConsumer
where
    I: Send + Sync + 'static,
    F: Fn(Envelope<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |envelope: Envelope<AnyPayload>| {
        let stage = stage.clone();
        match envelope.downcast::<I>() {
            Ok(typed) => {
                let output = consume(typed);
                async move { output.await.map_err(|err| ProcessingError::in_stage(&stage, err)) }
                    .boxed()
            }
            Err(_) => async move {
                Err(ProcessingError::PayloadType {
                    stage,
                    expected: std::any::type_name::<I>(),
                })
            }
            .boxed(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullSource;

    #[async_trait]
    impl InboundAdapter for NullSource {
        async fn receive(&self) -> Option<Envelope<AnyPayload>> {
            None
        }
    }

    fn source(builder: PipelineBuilder, id: &str, channel: &str) -> PipelineBuilder {
        builder.inbound(id, channel, Arc::new(NullSource))
    }

    #[test]
    fn linear_graph_builds() {
        let pipeline = source(PipelineBuilder::new(), "numbers", "raw")
            .process("double", "raw", "doubled", AckStrategy::PreProcessing, |n: i64| {
                Ok(n * 2)
            })
            .sink("collect", "doubled", AckStrategy::PostProcessing, |_: i64| Ok(()))
            .build()
            .expect("valid wiring");

        let topology = pipeline.topology();
        assert_eq!(topology.len(), 3);
        assert_eq!(topology[0].kind, "inbound-adapter");
        assert_eq!(topology[1].stage, StageId::new("double"));
        assert_eq!(topology[1].strategy, AckStrategy::PreProcessing);
        assert_eq!(pipeline.edges.len(), 2);
    }

    #[test]
    fn consumed_channel_without_producer_is_rejected() {
        let err = PipelineBuilder::new()
            .sink("collect", "nowhere", AckStrategy::None, |_: i64| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, WiringError::MissingProducer(c) if c.as_str() == "nowhere"));
    }

    #[test]
    fn two_producers_for_one_channel_are_rejected() {
        let builder = source(PipelineBuilder::new(), "a", "shared");
        let err = source(builder, "b", "shared")
            .sink("collect", "shared", AckStrategy::None, |_: i64| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, WiringError::DuplicateProducer { count: 2, .. }));
    }

    #[test]
    fn fan_out_is_rejected() {
        let err = source(PipelineBuilder::new(), "a", "shared")
            .sink("one", "shared", AckStrategy::None, |_: i64| Ok(()))
            .sink("two", "shared", AckStrategy::None, |_: i64| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, WiringError::FanOut { count: 2, .. }));
    }

    #[test]
    fn unconsumed_channel_is_rejected() {
        let err = source(PipelineBuilder::new(), "a", "dangling")
            .build()
            .unwrap_err();
        assert!(matches!(err, WiringError::UnconsumedChannel(c) if c.as_str() == "dangling"));
    }

    #[test]
    fn duplicate_stage_id_is_rejected() {
        let builder = source(PipelineBuilder::new(), "dup", "x");
        let err = builder
            .sink("dup", "x", AckStrategy::None, |_: i64| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, WiringError::DuplicateStage(id) if id.as_str() == "dup"));
    }

    #[test]
    fn cycle_is_rejected() {
        let err = PipelineBuilder::new()
            .process("a", "x", "y", AckStrategy::None, |n: i64| Ok(n))
            .process("b", "y", "x", AckStrategy::None, |n: i64| Ok(n))
            .build()
            .unwrap_err();
        assert!(matches!(err, WiringError::Cycle(_)));
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        assert!(matches!(
            PipelineBuilder::new().build().unwrap_err(),
            WiringError::Empty
        ));
    }
}
