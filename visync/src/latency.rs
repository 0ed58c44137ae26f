use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use log::debug;

/// Most recent one-way transit estimate, in seconds.
///
/// Cloning shares the underlying cell so the task that reads viewer echoes
/// and the task that stamps outgoing events see the same value.
#[derive(Clone, Debug, Default)]
pub struct LatencyEstimate {
    bits: Arc<AtomicU64>,
}

impl LatencyEstimate {
    pub fn new() -> LatencyEstimate {
        LatencyEstimate::default()
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, latency: f64) {
        let latency = if latency.is_finite() {
            latency.max(0.0)
        } else {
            0.0
        };
        self.bits.store(latency.to_bits(), Ordering::Relaxed);
    }

    /// Fold in a round trip: the echo of a message sent at `sent` came back
    /// at `now` (both in wall clock seconds).
    pub fn record_echo(&self, sent: f64, now: f64) -> f64 {
        let latency = ((now - sent) / 2.0).max(0.0);
        self.set(latency);
        debug!(target: "visync", "latency: {:.1}ms", latency * 1000.0);
        latency
    }
}
