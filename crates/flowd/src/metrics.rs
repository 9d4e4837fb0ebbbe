//! Process-wide metrics registry.
//!
//! Initialised once at startup, never mutated after registration. The
//! HTTP `/metrics` endpoint renders the registry in Prometheus text
//! format.

use prometheus::{
    register_counter_with_registry, register_counter_vec_with_registry,
    register_histogram_vec_with_registry, Counter, CounterVec, Encoder, HistogramVec, Registry,
    TextEncoder,
};

/// Metrics handle shared across handlers.
pub struct Metrics {
    registry: Registry,
    requests_total: Counter,
    jobs_processed_total: CounterVec,
    webhooks_total: CounterVec,
    qa_verdicts_total: CounterVec,
    estimated_tokens: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let requests_total = register_counter_with_registry!(
            "flowd_requests_total",
            "Total HTTP requests",
            registry
        )
        .expect("register requests_total");
        let jobs_processed_total = register_counter_vec_with_registry!(
            "flowd_jobs_processed_total",
            "Total jobs processed",
            &["job_type", "status"],
            registry
        )
        .expect("register jobs_processed_total");
        let webhooks_total = register_counter_vec_with_registry!(
            "flowd_webhooks_total",
            "Total webhooks received",
            &["provider", "status"],
            registry
        )
        .expect("register webhooks_total");
        let qa_verdicts_total = register_counter_vec_with_registry!(
            "flowd_qa_verdicts_total",
            "QA verdicts by outcome",
            &["verdict"],
            registry
        )
        .expect("register qa_verdicts_total");
        let estimated_tokens = register_histogram_vec_with_registry!(
            "flowd_estimated_prompt_tokens",
            "Estimated prompt tokens per engine call",
            &["phase"],
            vec![100.0, 1000.0, 10000.0, 50000.0, 100000.0, 500000.0],
            registry
        )
        .expect("register estimated_tokens");

        Self {
            registry,
            requests_total,
            jobs_processed_total,
            webhooks_total,
            qa_verdicts_total,
            estimated_tokens,
        }
    }

    pub fn inc_request(&self) {
        self.requests_total.inc();
    }

    pub fn inc_job(&self, job_type: &str, status: &str) {
        self.jobs_processed_total
            .with_label_values(&[job_type, status])
            .inc();
    }

    pub fn inc_webhook(&self, provider: &str, status: &str) {
        self.webhooks_total
            .with_label_values(&[provider, status])
            .inc();
    }

    pub fn inc_qa_verdict(&self, verdict: &str) {
        self.qa_verdicts_total.with_label_values(&[verdict]).inc();
    }

    pub fn observe_tokens(&self, phase: &str, estimated: u64) {
        self.estimated_tokens
            .with_label_values(&[phase])
            .observe(estimated as f64);
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if encoder.encode(&families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}
