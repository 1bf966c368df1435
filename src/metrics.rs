//! Process-wide metrics registry.
//!
//! Initialised once at startup and passed to workers as an owned handle.
//! Counters and gauges are plain atomics; reading a snapshot takes the
//! registry lock but recording does not.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<Registry>,
}

#[derive(Default)]
struct Registry {
    counters: Mutex<BTreeMap<String, Arc<AtomicU64>>>,
    gauges: Mutex<BTreeMap<String, Arc<AtomicI64>>>,
}

/// Monotonic event count.
#[derive(Clone)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Instantaneous level (e.g. queue depth).
#[derive(Clone)]
pub struct Gauge(Arc<AtomicI64>);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn add(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or register the counter `name`. Handles to the same name share
    /// one cell.
    pub fn counter(&self, name: &str) -> Counter {
        let mut counters = self.inner.counters.lock().expect("metrics lock poisoned");
        let cell = counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        Counter(Arc::clone(cell))
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        let mut gauges = self.inner.gauges.lock().expect("metrics lock poisoned");
        let cell = gauges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)));
        Gauge(Arc::clone(cell))
    }

    /// Point-in-time snapshot of every counter.
    pub fn counter_values(&self) -> BTreeMap<String, u64> {
        let counters = self.inner.counters.lock().expect("metrics lock poisoned");
        counters
            .iter()
            .map(|(name, cell)| (name.clone(), cell.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn gauge_values(&self) -> BTreeMap<String, i64> {
        let gauges = self.inner.gauges.lock().expect("metrics lock poisoned");
        gauges
            .iter()
            .map(|(name, cell)| (name.clone(), cell.load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_with_same_name_share_a_cell() {
        let metrics = Metrics::new();
        let a = metrics.counter("entity.customer.updates");
        let b = metrics.counter("entity.customer.updates");
        a.incr();
        b.add(2);
        assert_eq!(a.get(), 3);
        assert_eq!(
            metrics.counter_values().get("entity.customer.updates"),
            Some(&3)
        );
    }

    #[test]
    fn gauges_track_levels() {
        let metrics = Metrics::new();
        let depth = metrics.gauge("queue.depth");
        depth.set(5);
        depth.add(-2);
        assert_eq!(depth.get(), 3);
        assert_eq!(metrics.gauge_values().get("queue.depth"), Some(&3));
    }
}
