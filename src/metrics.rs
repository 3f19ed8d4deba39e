//! Process-lifetime counters, rendered in Prometheus text format by the
//! Operator API's `/metrics` endpoint. Grounded on `estuary-flow`'s
//! `metrics` + `metrics-exporter-prometheus` dependency pair (the only
//! metrics precedent in the retrieval pack).

// Explicit `::metrics::` throughout: this module is itself named
// `metrics` (`crate::metrics`), which shadows the extern crate of the
// same name for any bare `metrics::...` path written in this file.
use ::metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

pub struct Metrics {
    handle: PrometheusHandle,
    started_at: Instant,
}

impl Metrics {
    /// Installs the global recorder and registers the node's counters
    /// and gauges. Must be called exactly once, before any other
    /// component records a metric.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("installing the prometheus recorder exactly once at startup");

        describe_counter!("requests_processed", "Chain-originated requests dispatched to the job engine");
        describe_counter!("proofs_generated", "Groth16 proofs produced, by circuit");
        describe_counter!("transactions_sent", "Transactions broadcast by the tx manager");
        describe_counter!("aggregations_performed", "Data-feed aggregation runs completed");
        describe_counter!("outliers_filtered", "Samples classified as outliers and excluded");
        describe_gauge!("dlq_size", "Jobs currently dead-lettered");
        describe_gauge!("uptime_seconds", "Seconds since process start");

        Self {
            handle,
            started_at: Instant::now(),
        }
    }

    pub fn record_request_processed(&self) {
        counter!("requests_processed").increment(1);
    }

    pub fn record_proof_generated(&self, circuit: &'static str) {
        counter!("proofs_generated", "circuit" => circuit).increment(1);
    }

    pub fn record_transaction_sent(&self) {
        counter!("transactions_sent").increment(1);
    }

    pub fn record_aggregation_performed(&self) {
        counter!("aggregations_performed").increment(1);
    }

    pub fn record_outliers_filtered(&self, count: u64) {
        counter!("outliers_filtered").increment(count);
    }

    pub fn set_dlq_size(&self, size: u64) {
        gauge!("dlq_size").set(size as f64);
    }

    /// Refreshes `uptime_seconds` and renders the full Prometheus text
    /// exposition for the `/metrics` endpoint.
    pub fn render(&self) -> String {
        gauge!("uptime_seconds").set(self.started_at.elapsed().as_secs_f64());
        self.handle.render()
    }
}
