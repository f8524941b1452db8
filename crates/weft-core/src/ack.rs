use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::ProcessingError;

/// Callback fired when a logical message is acknowledged.
pub type AckHandler = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Callback fired when a logical message is negatively acknowledged.
pub type NackHandler = Box<dyn FnOnce(ProcessingError) -> BoxFuture<'static, ()> + Send>;

const PENDING: u8 = 0;
const ACKED: u8 = 1;
const NACKED: u8 = 2;

/// Settlement outcome of a logical message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementState {
    Pending,
    Acked,
    Nacked,
}

/// One-shot settlement record for a logical message.
///
/// Every envelope derived from the same inbound message shares one
/// `Settlement` behind an `Arc`, so the one-shot guarantee is a single atomic
/// flag per logical message rather than per envelope copy. Handlers are bound
/// at construction and taken exactly once; duplicate settlement attempts are
/// absorbed and logged, never surfaced as faults.
pub struct Settlement {
    state: AtomicU8,
    ack: Mutex<Option<AckHandler>>,
    nack: Mutex<Option<NackHandler>>,
}

impl Settlement {
    /// Bind settlement handlers. `ack` and `nack` run at most once between
    /// them: whichever side settles first wins.
    pub fn new<A, AF, N, NF>(ack: A, nack: N) -> Arc<Self>
    where
        A: FnOnce() -> AF + Send + 'static,
        AF: Future<Output = ()> + Send + 'static,
        N: FnOnce(ProcessingError) -> NF + Send + 'static,
        NF: Future<Output = ()> + Send + 'static,
    {
        Self::from_handlers(
            Box::new(move || ack().boxed()),
            Box::new(move |reason| nack(reason).boxed()),
        )
    }

    /// Bind already-boxed handlers.
    pub fn from_handlers(ack: AckHandler, nack: NackHandler) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
            ack: Mutex::new(Some(ack)),
            nack: Mutex::new(Some(nack)),
        })
    }

    /// A settlement with no observable effects, for messages whose origin
    /// does not demand settlement (e.g. generated test data).
    pub fn detached() -> Arc<Self> {
        Self::new(|| async {}, |_| async {})
    }

    pub fn state(&self) -> SettlementState {
        match self.state.load(Ordering::Acquire) {
            ACKED => SettlementState::Acked,
            NACKED => SettlementState::Nacked,
            _ => SettlementState::Pending,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state() != SettlementState::Pending
    }

    /// Acknowledge this message. Runs the ack handler exactly once; any later
    /// ack or nack is a no-op.
    pub async fn ack(&self) {
        if self
            .state
            .compare_exchange(PENDING, ACKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("duplicate acknowledgment absorbed");
            return;
        }
        // The losing handler is dropped so delegation chains are released.
        self.nack.lock().await.take();
        let handler = self.ack.lock().await.take();
        if let Some(handler) = handler {
            handler().await;
        }
    }

    /// Negatively acknowledge this message with `reason`. Runs the nack
    /// handler exactly once; any later ack or nack is a no-op.
    pub async fn nack(&self, reason: ProcessingError) {
        if self
            .state
            .compare_exchange(PENDING, NACKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(reason = %reason, "negative acknowledgment after settlement absorbed");
            return;
        }
        self.ack.lock().await.take();
        let handler = self.nack.lock().await.take();
        if let Some(handler) = handler {
            handler(reason).await;
        }
    }
}

impl std::fmt::Debug for Settlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settlement")
            .field("state", &self.state())
            .finish()
    }
}

/// Acknowledgment strategy a stage applies to its inbound envelopes.
///
/// Payload-shaped stage logic is wrapped by the engine according to this
/// strategy. Envelope-shaped logic bypasses the engine entirely: whoever
/// builds the outbound envelope owns settlement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckStrategy {
    /// Never settle on the user's behalf. The outbound envelope delegates to
    /// the inbound settlement unchanged; a downstream consumer settles both.
    None,
    /// Acknowledge the inbound envelope immediately before user logic runs,
    /// regardless of its outcome.
    #[default]
    PreProcessing,
    /// Acknowledge the inbound envelope only once the outbound envelope is
    /// itself acknowledged: settlement propagates strictly sink-to-source.
    PostProcessing,
}

impl AckStrategy {
    /// Pre-processing side of the strategy, applied before user logic runs.
    pub(crate) async fn settle_before(&self, inbound: &Arc<Settlement>) {
        if matches!(self, AckStrategy::PreProcessing) {
            inbound.ack().await;
        }
    }

    /// Bind the settlement of an outbound envelope derived from `inbound`.
    ///
    /// Under `PostProcessing` the outbound envelope gets a fresh settlement
    /// whose ack marks outbound-side completion first and then acknowledges
    /// the inbound settlement; nack delegates the failure upstream. The other
    /// strategies leave the shared settlement in place.
    pub(crate) fn bind_outbound<T>(
        &self,
        inbound: &Arc<Settlement>,
        outbound: Envelope<T>,
    ) -> Envelope<T> {
        match self {
            AckStrategy::None | AckStrategy::PreProcessing => outbound,
            AckStrategy::PostProcessing => {
                let ack_target = Arc::clone(inbound);
                let nack_target = Arc::clone(inbound);
                let settlement = Settlement::new(
                    move || async move { ack_target.ack().await },
                    move |reason| async move { nack_target.nack(reason).await },
                );
                outbound.replace_settlement(settlement)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recording(
        log: &Arc<StdMutex<Vec<String>>>,
        label: &str,
    ) -> Arc<Settlement> {
        let ack_log = Arc::clone(log);
        let nack_log = Arc::clone(log);
        let ack_label = format!("ack:{label}");
        let nack_label = format!("nack:{label}");
        Settlement::new(
            move || {
                ack_log.lock().unwrap().push(ack_label);
                std::future::ready(())
            },
            move |_| {
                nack_log.lock().unwrap().push(nack_label);
                std::future::ready(())
            },
        )
    }

    fn stage_failure() -> ProcessingError {
        ProcessingError::Stage {
            stage: crate::types::StageId::new("test"),
            message: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn ack_fires_exactly_once() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let settlement = recording(&log, "m");

        settlement.ack().await;
        settlement.ack().await;

        assert_eq!(*log.lock().unwrap(), vec!["ack:m".to_string()]);
        assert_eq!(settlement.state(), SettlementState::Acked);
    }

    #[tokio::test]
    async fn nack_after_ack_is_absorbed() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let settlement = recording(&log, "m");

        settlement.ack().await;
        settlement.nack(stage_failure()).await;

        assert_eq!(*log.lock().unwrap(), vec!["ack:m".to_string()]);
        assert_eq!(settlement.state(), SettlementState::Acked);
    }

    #[tokio::test]
    async fn ack_after_nack_is_absorbed() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let settlement = recording(&log, "m");

        settlement.nack(stage_failure()).await;
        settlement.ack().await;

        assert_eq!(*log.lock().unwrap(), vec!["nack:m".to_string()]);
        assert_eq!(settlement.state(), SettlementState::Nacked);
    }

    #[test]
    fn default_strategy_is_pre_processing() {
        assert_eq!(AckStrategy::default(), AckStrategy::PreProcessing);
    }

    /// A depth-3 post-processing chain settles sink-to-source when only the
    /// terminal envelope is acknowledged.
    #[tokio::test]
    async fn post_processing_chain_acks_sink_to_source() {
        let log = Arc::new(StdMutex::new(Vec::new()));

        let source = recording(&log, "0");
        let e0 = Envelope::new("m").replace_settlement(Arc::clone(&source));

        // Hop 1: derived envelope bound post-processing, with a recorder
        // spliced in the way a test instruments an intermediate hop.
        let inbound = Arc::clone(e0.settlement());
        let e1 = AckStrategy::PostProcessing.bind_outbound(&inbound, e0.with_payload("m1"));
        let s1 = Arc::clone(e1.settlement());
        let hop1_log = Arc::clone(&log);
        let e1 = e1.with_ack(move || {
            hop1_log.lock().unwrap().push("ack:1".to_string());
            async move { s1.ack().await }
        });

        // Hop 2.
        let inbound = Arc::clone(e1.settlement());
        let e2 = AckStrategy::PostProcessing.bind_outbound(&inbound, e1.with_payload("m2"));
        let s2 = Arc::clone(e2.settlement());
        let hop2_log = Arc::clone(&log);
        let e2 = e2.with_ack(move || {
            hop2_log.lock().unwrap().push("ack:2".to_string());
            async move { s2.ack().await }
        });

        assert_eq!(source.state(), SettlementState::Pending);

        e2.ack().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["ack:2".to_string(), "ack:1".to_string(), "ack:0".to_string()]
        );
        assert_eq!(source.state(), SettlementState::Acked);
    }

    #[tokio::test]
    async fn post_processing_nack_delegates_upstream() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let source = recording(&log, "0");
        let e0 = Envelope::new("m").replace_settlement(Arc::clone(&source));

        let inbound = Arc::clone(e0.settlement());
        let e1 = AckStrategy::PostProcessing.bind_outbound(&inbound, e0.with_payload("m1"));
        e1.nack(stage_failure()).await;

        assert_eq!(*log.lock().unwrap(), vec!["nack:0".to_string()]);
        assert_eq!(source.state(), SettlementState::Nacked);
    }

    #[tokio::test]
    async fn none_and_pre_leave_the_shared_settlement_in_place() {
        let source = Settlement::detached();
        let e0 = Envelope::new(1u32).replace_settlement(Arc::clone(&source));
        let shared = Arc::clone(e0.settlement());

        let out = AckStrategy::None.bind_outbound(&shared, e0.with_payload(2u32));
        assert!(Arc::ptr_eq(out.settlement(), &shared));

        let out = AckStrategy::PreProcessing.bind_outbound(&shared, out);
        assert!(Arc::ptr_eq(out.settlement(), &shared));
    }
}
