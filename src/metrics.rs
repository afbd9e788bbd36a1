use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// The worker's metrics sink: counters and timers addressed by name. This
/// crate only ever reports against two names (`worker.vm.provider.gce.boot`
/// and `worker.vm.provider.gce.boot.timeout`); the embedder owns where
/// those numbers end up.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str);
    fn record_duration(&self, name: &str, duration: Duration);
}

/// Default sink so the crate works unconfigured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment_counter(&self, _name: &str) {}
    fn record_duration(&self, _name: &str, _duration: Duration) {}
}

/// In-memory sink for tests: records every counter increment and timer
/// sample so assertions can check both count and (roughly) magnitude.
#[derive(Default)]
pub struct InMemoryMetricsSink {
    counters: Mutex<std::collections::HashMap<String, u64>>,
    durations: Mutex<std::collections::HashMap<String, Vec<Duration>>>,
    calls: AtomicU64,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn duration_samples(&self, name: &str) -> usize {
        self.durations.lock().unwrap().get(name).map(Vec::len).unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn increment_counter(&self, name: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.counters.lock().unwrap().entry(name.to_owned()).or_insert(0) += 1;
    }

    fn record_duration(&self, name: &str, duration: Duration) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.durations.lock().unwrap().entry(name.to_owned()).or_default().push(duration);
    }
}

pub const METRIC_BOOT_TIMER: &str = "worker.vm.provider.gce.boot";
pub const METRIC_BOOT_TIMEOUT_COUNTER: &str = "worker.vm.provider.gce.boot.timeout";
