//! Bridge metrics for monitoring and observability.
//!
//! Counters for dispatches, host calls, errors, rewrite events and handle
//! churn, exported in Prometheus text format.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Host-initiated dispatch kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    /// HTTP request
    Request,
    /// Scheduled tick
    Scheduled,
    /// Queue batch delivery
    Queue,
    /// Actor fetch
    ActorFetch,
    /// Actor alarm
    ActorAlarm,
}

impl DispatchKind {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchKind::Request => "request",
            DispatchKind::Scheduled => "scheduled",
            DispatchKind::Queue => "queue",
            DispatchKind::ActorFetch => "actor_fetch",
            DispatchKind::ActorAlarm => "actor_alarm",
        }
    }
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    /// Total dispatches
    pub total_dispatches: u64,
    /// Dispatches that ended in a guest or bridge error
    pub failed_dispatches: u64,
    /// Total host function calls
    pub total_host_calls: u64,
    /// Rewrite events delivered to guest handlers
    pub rewrite_events: u64,
    /// Live actor handles
    pub live_actor_handles: usize,
    /// Live queue handles (messages + batches)
    pub live_queue_handles: usize,
    /// Live rewrite handler registrations
    pub live_rewrite_handlers: usize,
}

/// Metrics collector for one guest-runtime instance
pub struct BridgeMetrics {
    total_dispatches: AtomicU64,
    failed_dispatches: AtomicU64,
    rewrite_events: AtomicU64,
    guest_errors_reported: AtomicU64,
    report_failures: AtomicU64,
    dispatches: parking_lot::Mutex<HashMap<DispatchKind, u64>>,
    host_calls: parking_lot::Mutex<HashMap<String, u64>>,
    error_counts: parking_lot::Mutex<HashMap<String, u64>>,
}

impl BridgeMetrics {
    /// Create a new collector
    pub fn new() -> Self {
        Self {
            total_dispatches: AtomicU64::new(0),
            failed_dispatches: AtomicU64::new(0),
            rewrite_events: AtomicU64::new(0),
            guest_errors_reported: AtomicU64::new(0),
            report_failures: AtomicU64::new(0),
            dispatches: parking_lot::Mutex::new(HashMap::new()),
            host_calls: parking_lot::Mutex::new(HashMap::new()),
            error_counts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Record a finished dispatch
    pub fn record_dispatch(&self, kind: DispatchKind, success: bool) {
        self.total_dispatches.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_dispatches.fetch_add(1, Ordering::Relaxed);
        }
        *self.dispatches.lock().entry(kind).or_insert(0) += 1;
    }

    /// Record one host function call
    pub fn record_host_call(&self, name: &str) {
        *self.host_calls.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    /// Record an error by code
    pub fn record_error(&self, error_code: &str) {
        let mut counts = self.error_counts.lock();
        *counts.entry(error_code.to_string()).or_insert(0) += 1;
    }

    /// Record a rewrite event round trip
    pub fn record_rewrite_event(&self) {
        self.rewrite_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a best-effort error report
    pub fn record_report(&self, delivered: bool) {
        if delivered {
            self.guest_errors_reported.fetch_add(1, Ordering::Relaxed);
        } else {
            self.report_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Total dispatches
    pub fn total_dispatches(&self) -> u64 {
        self.total_dispatches.load(Ordering::Relaxed)
    }

    /// Failed dispatches
    pub fn failed_dispatches(&self) -> u64 {
        self.failed_dispatches.load(Ordering::Relaxed)
    }

    /// Rewrite events
    pub fn rewrite_events(&self) -> u64 {
        self.rewrite_events.load(Ordering::Relaxed)
    }

    /// Reports delivered to the error sink
    pub fn reports_delivered(&self) -> u64 {
        self.guest_errors_reported.load(Ordering::Relaxed)
    }

    /// Reports that could not be delivered
    pub fn report_failures(&self) -> u64 {
        self.report_failures.load(Ordering::Relaxed)
    }

    /// Dispatch counts by kind
    pub fn dispatches(&self) -> HashMap<DispatchKind, u64> {
        self.dispatches.lock().clone()
    }

    /// Host call counts by function name
    pub fn host_calls(&self) -> HashMap<String, u64> {
        self.host_calls.lock().clone()
    }

    /// Total host calls
    pub fn total_host_calls(&self) -> u64 {
        self.host_calls.lock().values().sum()
    }

    /// Error counts by code
    pub fn error_counts(&self) -> HashMap<String, u64> {
        self.error_counts.lock().clone()
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.total_dispatches.store(0, Ordering::Relaxed);
        self.failed_dispatches.store(0, Ordering::Relaxed);
        self.rewrite_events.store(0, Ordering::Relaxed);
        self.guest_errors_reported.store(0, Ordering::Relaxed);
        self.report_failures.store(0, Ordering::Relaxed);
        self.dispatches.lock().clear();
        self.host_calls.lock().clear();
        self.error_counts.lock().clear();
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP bridge_dispatches_total Host-initiated dispatches\n");
        output.push_str("# TYPE bridge_dispatches_total counter\n");
        let mut dispatches: Vec<_> = self.dispatches().into_iter().collect();
        dispatches.sort_by_key(|(kind, _)| kind.as_str());
        for (kind, count) in dispatches {
            output.push_str(&format!(
                "bridge_dispatches_total{{kind=\"{}\"}} {}\n",
                kind.as_str(),
                count
            ));
        }

        output.push_str("\n# HELP bridge_dispatch_failures_total Failed dispatches\n");
        output.push_str("# TYPE bridge_dispatch_failures_total counter\n");
        output.push_str(&format!(
            "bridge_dispatch_failures_total {}\n",
            self.failed_dispatches()
        ));

        output.push_str("\n# HELP bridge_rewrite_events_total Rewrite event round trips\n");
        output.push_str("# TYPE bridge_rewrite_events_total counter\n");
        output.push_str(&format!(
            "bridge_rewrite_events_total {}\n",
            self.rewrite_events()
        ));

        output.push_str("\n# HELP bridge_error_reports_total Error reports by outcome\n");
        output.push_str("# TYPE bridge_error_reports_total counter\n");
        output.push_str(&format!(
            "bridge_error_reports_total{{outcome=\"delivered\"}} {}\n",
            self.reports_delivered()
        ));
        output.push_str(&format!(
            "bridge_error_reports_total{{outcome=\"failed\"}} {}\n",
            self.report_failures()
        ));

        output.push_str("\n# HELP bridge_host_calls_total Host function calls\n");
        output.push_str("# TYPE bridge_host_calls_total counter\n");
        let mut calls: Vec<_> = self.host_calls().into_iter().collect();
        calls.sort();
        for (name, count) in calls {
            output.push_str(&format!(
                "bridge_host_calls_total{{function=\"{}\"}} {}\n",
                name, count
            ));
        }

        output.push_str("\n# HELP bridge_errors_total Error counts by code\n");
        output.push_str("# TYPE bridge_errors_total counter\n");
        let mut errors: Vec<_> = self.error_counts().into_iter().collect();
        errors.sort();
        for (code, count) in errors {
            output.push_str(&format!(
                "bridge_errors_total{{code=\"{}\"}} {}\n",
                code, count
            ));
        }

        output
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_counts() {
        let metrics = BridgeMetrics::new();
        metrics.record_dispatch(DispatchKind::Request, true);
        metrics.record_dispatch(DispatchKind::Queue, false);

        assert_eq!(metrics.total_dispatches(), 2);
        assert_eq!(metrics.failed_dispatches(), 1);
        assert_eq!(metrics.dispatches().get(&DispatchKind::Queue), Some(&1));
    }

    #[test]
    fn test_host_call_counts() {
        let metrics = BridgeMetrics::new();
        metrics.record_host_call("storage_op");
        metrics.record_host_call("storage_op");
        metrics.record_host_call("http_fetch");
        assert_eq!(metrics.total_host_calls(), 3);
    }

    #[test]
    fn test_reset() {
        let metrics = BridgeMetrics::new();
        metrics.record_rewrite_event();
        metrics.record_error("TIMEOUT");
        metrics.reset();
        assert_eq!(metrics.rewrite_events(), 0);
        assert!(metrics.error_counts().is_empty());
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = BridgeMetrics::new();
        metrics.record_dispatch(DispatchKind::ActorFetch, true);
        metrics.record_host_call("queue_message_op");
        metrics.record_report(false);

        let output = metrics.to_prometheus();
        assert!(output.contains("bridge_dispatches_total{kind=\"actor_fetch\"} 1"));
        assert!(output.contains("bridge_host_calls_total{function=\"queue_message_op\"} 1"));
        assert!(output.contains("bridge_error_reports_total{outcome=\"failed\"} 1"));
    }
}
