use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Cumulative counters for pipeline activity.
///
/// Counters only; exporting them is the host's business.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    received: AtomicU64,
    forwarded: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl PipelineMetrics {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`PipelineMetrics`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Envelopes that entered a stage.
    pub received: u64,
    /// Envelopes emitted onto a channel.
    pub forwarded: u64,
    /// Envelopes consumed at a sink or handed to an outbound adapter.
    pub delivered: u64,
    /// Envelopes dropped with a negative acknowledgment by the engine.
    pub failed: u64,
}
