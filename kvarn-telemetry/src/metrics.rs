//! ## kvarn-telemetry::metrics
//! **Prometheus counters for pools and the scheduler**
//!
//! Each runtime context owns a recorder with a private registry, so several
//! contexts (one per test, say) never collide on metric names.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::TelemetryError;

/// Watermark edge label for "crossed below the low watermark".
pub const EDGE_LOW: &str = "low";
/// Watermark edge label for "recovered to the high watermark".
pub const EDGE_CLEARED: &str = "cleared";

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    registry: Registry,
    alloc_failures: IntCounterVec,
    watermark_edges: IntCounterVec,
    scheduled_events: IntCounter,
    atomic_holds: IntCounter,
    device_polls: IntCounter,
    finalized_queues: IntCounter,
}

impl MetricsRecorder {
    pub fn new(namespace: &str) -> Result<Self, TelemetryError> {
        let registry = Registry::new();

        let alloc_failures = IntCounterVec::new(
            Opts::new("pool_alloc_failures_total", "Allocations that found the pool empty")
                .namespace(namespace),
            &["pool"],
        )?;
        let watermark_edges = IntCounterVec::new(
            Opts::new("pool_watermark_edges_total", "Pool watermark transitions")
                .namespace(namespace),
            &["pool", "edge"],
        )?;
        let scheduled_events = IntCounter::with_opts(
            Opts::new("sched_events_total", "Events handed to workers").namespace(namespace),
        )?;
        let atomic_holds = IntCounter::with_opts(
            Opts::new("sched_atomic_holds_total", "Atomic queue holds taken").namespace(namespace),
        )?;
        let device_polls = IntCounter::with_opts(
            Opts::new("sched_device_polls_total", "Poll callbacks invoked").namespace(namespace),
        )?;
        let finalized_queues = IntCounter::with_opts(
            Opts::new(
                "queue_deferred_destroys_total",
                "Destroyed queues reclaimed by the scheduler",
            )
            .namespace(namespace),
        )?;

        registry.register(Box::new(alloc_failures.clone()))?;
        registry.register(Box::new(watermark_edges.clone()))?;
        registry.register(Box::new(scheduled_events.clone()))?;
        registry.register(Box::new(atomic_holds.clone()))?;
        registry.register(Box::new(device_polls.clone()))?;
        registry.register(Box::new(finalized_queues.clone()))?;

        Ok(Self {
            registry,
            alloc_failures,
            watermark_edges,
            scheduled_events,
            atomic_holds,
            device_polls,
            finalized_queues,
        })
    }

    pub fn gather_metrics(&self) -> Result<String, TelemetryError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    #[inline]
    pub fn inc_alloc_failure(&self, pool: &str) {
        self.alloc_failures.with_label_values(&[pool]).inc();
    }

    #[inline]
    pub fn inc_watermark_edge(&self, pool: &str, edge: &str) {
        self.watermark_edges.with_label_values(&[pool, edge]).inc();
    }

    #[inline]
    pub fn add_scheduled_events(&self, n: usize) {
        self.scheduled_events.inc_by(n as u64);
    }

    #[inline]
    pub fn inc_atomic_hold(&self) {
        self.atomic_holds.inc();
    }

    #[inline]
    pub fn inc_device_poll(&self) {
        self.device_polls.inc();
    }

    #[inline]
    pub fn inc_finalized_queue(&self) {
        self.finalized_queues.inc();
    }

    pub fn alloc_failures(&self, pool: &str) -> u64 {
        self.alloc_failures.with_label_values(&[pool]).get()
    }

    pub fn watermark_edges(&self, pool: &str, edge: &str) -> u64 {
        self.watermark_edges.with_label_values(&[pool, edge]).get()
    }

    pub fn scheduled_events(&self) -> u64 {
        self.scheduled_events.get()
    }

    pub fn atomic_holds(&self) -> u64 {
        self.atomic_holds.get()
    }

    pub fn device_polls(&self) -> u64 {
        self.device_polls.get()
    }

    pub fn finalized_queues(&self) -> u64 {
        self.finalized_queues.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let metrics = MetricsRecorder::new("kvarn_test").unwrap();
        metrics.inc_alloc_failure("pkt");
        metrics.inc_watermark_edge("pkt", EDGE_LOW);
        metrics.add_scheduled_events(3);

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("kvarn_test_pool_alloc_failures_total{pool=\"pkt\"} 1"));
        assert!(text.contains("kvarn_test_sched_events_total 3"));
        assert_eq!(metrics.watermark_edges("pkt", EDGE_LOW), 1);
        assert_eq!(metrics.watermark_edges("pkt", EDGE_CLEARED), 0);
    }

    #[test]
    fn recorders_do_not_share_registries() {
        let a = MetricsRecorder::new("kvarn").unwrap();
        let b = MetricsRecorder::new("kvarn").unwrap();
        a.inc_device_poll();
        assert_eq!(a.device_polls(), 1);
        assert_eq!(b.device_polls(), 0);
    }

    #[test]
    fn rejects_invalid_namespace() {
        assert!(MetricsRecorder::new("not valid").is_err());
    }
}
