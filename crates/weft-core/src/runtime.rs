use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::graph::Pipeline;
use crate::metrics::PipelineMetrics;
use crate::stage::{StageDescriptor, StageLogic};
use crate::types::AnyPayload;

/// Runtime knobs for a started pipeline.
#[derive(Clone, Copy, Debug)]
pub struct PipelineConfig {
    /// Capacity of each channel edge. Bounds how many envelopes a stage may
    /// hold pending; the broker adapter is assumed to enforce credit-based
    /// flow control beyond this.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

impl Pipeline {
    /// Start the pipeline with default configuration.
    pub fn start(self) -> RunningPipeline {
        self.start_with(PipelineConfig::default())
    }

    /// Start one task per stage, wired by one bounded channel per edge.
    ///
    /// Envelopes flow in arrival order on each edge. Sources run until their
    /// adapter reports end of stream; closure then cascades downstream and
    /// [`RunningPipeline::completed`] resolves.
    pub fn start_with(self, config: PipelineConfig) -> RunningPipeline {
        let stage_count = self.stages.len();
        let mut senders: Vec<Option<mpsc::Sender<Envelope<AnyPayload>>>> =
            (0..stage_count).map(|_| None).collect();
        let mut receivers: Vec<Option<mpsc::Receiver<Envelope<AnyPayload>>>> =
            (0..stage_count).map(|_| None).collect();

        for edge in &self.edges {
            let (tx, rx) = mpsc::channel(config.channel_capacity);
            debug!(channel = %edge.channel, "channel edge wired");
            senders[edge.producer] = Some(tx);
            receivers[edge.consumer] = Some(rx);
        }

        info!(
            stages = stage_count,
            channel_capacity = config.channel_capacity,
            "pipeline started"
        );

        let metrics = Arc::clone(&self.metrics);
        let mut handles = Vec::with_capacity(stage_count);
        for (idx, stage) in self.stages.into_iter().enumerate() {
            let tx = senders[idx].take();
            let rx = receivers[idx].take();
            let metrics = Arc::clone(&metrics);
            handles.push(tokio::spawn(stage_task(stage, rx, tx, metrics)));
        }

        RunningPipeline { handles, metrics }
    }
}

async fn stage_task(
    stage: StageDescriptor,
    rx: Option<mpsc::Receiver<Envelope<AnyPayload>>>,
    tx: Option<mpsc::Sender<Envelope<AnyPayload>>>,
    metrics: Arc<PipelineMetrics>,
) {
    if let StageLogic::Inbound(adapter) = &stage.logic {
        let Some(tx) = tx else {
            return;
        };
        let adapter = Arc::clone(adapter);
        while let Some(envelope) = adapter.receive().await {
            metrics.record_received();
            if tx.send(envelope).await.is_err() {
                debug!(stage = %stage.id(), "downstream channel closed, source stopping");
                return;
            }
            metrics.record_forwarded();
        }
        debug!(stage = %stage.id(), "source exhausted");
        return;
    }

    let Some(mut rx) = rx else {
        return;
    };
    while let Some(envelope) = rx.recv().await {
        metrics.record_received();
        let Some(outbound) = stage.process(envelope, &metrics).await else {
            continue;
        };
        match &tx {
            Some(tx) => {
                if tx.send(outbound).await.is_err() {
                    debug!(stage = %stage.id(), "downstream channel closed, stage stopping");
                    return;
                }
                metrics.record_forwarded();
            }
            None => {
                // A terminal stage never yields an outbound envelope; the
                // graph validator keeps this arm unreachable.
                warn!(stage = %stage.id(), "terminal stage produced an envelope, dropping it");
            }
        }
    }
    debug!(stage = %stage.id(), "inbound channel closed, stage stopping");
}

/// Handle over a started pipeline's stage tasks.
pub struct RunningPipeline {
    handles: Vec<JoinHandle<()>>,
    metrics: Arc<PipelineMetrics>,
}

impl RunningPipeline {
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Wait until every stage task has stopped, i.e. all sources are
    /// exhausted and all in-flight envelopes reached a terminal stage.
    pub async fn completed(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "stage task aborted");
            }
        }
    }

    /// Tear the pipeline down without draining.
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
