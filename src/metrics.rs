// =============================================================================
// Metrics — counters and gauges, injected as an explicit dependency.
// =============================================================================
//
// A global metrics registry is the idiomatic shape in a lot of exchange-facing
// code, but it makes every consumer implicitly coupled to process-wide state.
// Here `Metrics` is a narrow trait passed as `Arc<dyn Metrics>` into whichever
// component needs to record something; `AtomicMetrics` is the one in-process
// implementation, good enough to run the binary and to assert against in
// tests without standing up a real metrics backend.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;

pub trait Metrics: Send + Sync {
    fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }
    fn incr_by(&self, name: &str, delta: u64);
    fn set_gauge(&self, name: &str, value: i64);
}

/// Lock-free-ish counters (an `RwLock<HashMap>` keyed by metric name, with
/// atomic values) sufficient for an in-process binary or test assertions.
#[derive(Default)]
pub struct AtomicMetrics {
    counters: RwLock<HashMap<String, AtomicU64>>,
    gauges: RwLock<HashMap<String, AtomicI64>>,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Metrics for AtomicMetrics {
    fn incr_by(&self, name: &str, delta: u64) {
        if let Some(counter) = self.counters.read().get(name) {
            counter.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        let mut counters = self.counters.write();
        counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    fn set_gauge(&self, name: &str, value: i64) {
        if let Some(gauge) = self.gauges.read().get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        let mut gauges = self.gauges.write();
        gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_name() {
        let metrics = AtomicMetrics::new();
        metrics.incr("ws.messages_sent");
        metrics.incr("ws.messages_sent");
        metrics.incr_by("reconnect_attempts_total", 3);
        assert_eq!(metrics.counter("ws.messages_sent"), 2);
        assert_eq!(metrics.counter("reconnect_attempts_total"), 3);
        assert_eq!(metrics.counter("unknown"), 0);
    }

    #[test]
    fn gauges_overwrite_per_name() {
        let metrics = AtomicMetrics::new();
        metrics.set_gauge("ws_state", 1);
        metrics.set_gauge("ws_state", 0);
        assert_eq!(metrics.gauge("ws_state"), 0);
    }
}
