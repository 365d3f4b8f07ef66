//! Collaborator surface consumed by the core. The admin HTTP/Prometheus
//! exporter itself is out of scope; this module only defines the interface
//! the core calls into, plus a lightweight in-process implementation usable
//! by tests and the thin binary when no real registry is wired up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Counters/gauges/histograms the core reports. A real deployment plugs in
/// a Prometheus-backed implementation; `ingestd-core` only depends on this
/// trait.
pub trait MetricsRegistry: Send + Sync {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)], delta: u64);
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64);
    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

fn key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut s = String::from(name);
    for (k, v) in labels {
        s.push('|');
        s.push_str(k);
        s.push('=');
        s.push_str(v);
    }
    s
}

/// Minimal in-memory registry: atomics keyed by name+labels. Good enough
/// for unit tests and a standalone agent run without an external collector.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    histograms: DashMap<String, Vec<f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&key(name, labels))
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        self.gauges
            .get(&key(name, labels))
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl MetricsRegistry for InMemoryMetrics {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)], delta: u64) {
        self.counters
            .entry(key(name, labels))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        self.gauges
            .entry(key(name, labels))
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms
            .entry(key(name, labels))
            .or_default()
            .push(value);
    }
}

/// Discards everything. Used where a caller hasn't wired in a real
/// registry/reporter but the component still needs a concrete `dyn`
/// target to report into.
#[derive(Default)]
pub struct NoopMetrics;

impl MetricsRegistry for NoopMetrics {
    fn incr_counter(&self, _name: &str, _labels: &[(&str, &str)], _delta: u64) {}
    fn set_gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: i64) {}
    fn observe_histogram(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
}

/// Liveness state for a single tracked component.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum HealthState {
    Up,
    Degraded,
    Down,
}

/// Aggregated health snapshot the core exposes to the (out-of-scope) admin
/// endpoint collaborator.
pub trait HealthReporter: Send + Sync {
    fn report(&self, component: &str, state: HealthState, detail: Option<&str>);
    fn snapshot(&self) -> HashMap<String, (HealthState, Option<String>)>;
}

#[derive(Default)]
pub struct NoopHealth;

impl HealthReporter for NoopHealth {
    fn report(&self, _component: &str, _state: HealthState, _detail: Option<&str>) {}
    fn snapshot(&self) -> HashMap<String, (HealthState, Option<String>)> {
        HashMap::new()
    }
}

#[derive(Default)]
pub struct InMemoryHealth {
    state: DashMap<String, (HealthState, Option<String>)>,
}

impl InMemoryHealth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl HealthReporter for InMemoryHealth {
    fn report(&self, component: &str, state: HealthState, detail: Option<&str>) {
        self.state
            .insert(component.to_string(), (state, detail.map(str::to_string)));
    }

    fn snapshot(&self) -> HashMap<String, (HealthState, Option<String>)> {
        self.state
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}
