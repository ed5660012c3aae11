//! Prometheus instruments for the job engine.

use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::Opts;

/// Label used when the engine was built without a server name.
const FALLBACK_SERVER_NAME: &str = "metrics_job";

/// Label used when no trace context accompanies an `add_job` call.
const FALLBACK_TRACE_ID: &str = "none";

/// The two instruments the engine reports to.
///
/// Both register into the process-global default registry at construction
/// and panic when an instrument with the same fully-qualified name already
/// exists there; construction is expected to be one-shot per process.
pub struct JobMetrics {
    add_total: IntCounterVec,
    run_cost: HistogramVec,
}

impl JobMetrics {
    /// Create and register the instruments under `namespace` (empty for
    /// none).
    pub fn new(namespace: &str) -> Self {
        let add_total = IntCounterVec::new(
            Opts::new(
                "metrics_elastic_job_add_total",
                "The total number of calls to add_job during the program run.",
            )
            .namespace(namespace),
            &["server_name", "job_key", "trace_id"],
        )
        .expect("invalid counter definition");

        let run_cost = HistogramVec::new(
            HistogramOpts::new("metrics_elastic_job_run_cost_seconds", "Job running time.")
                .namespace(namespace)
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 1.0, 2.5, 5.0]),
            &["server_name", "job_key"],
        )
        .expect("invalid histogram definition");

        let registry = prometheus::default_registry();
        registry
            .register(Box::new(add_total.clone()))
            .expect("metrics_elastic_job_add_total already registered");
        registry
            .register(Box::new(run_cost.clone()))
            .expect("metrics_elastic_job_run_cost_seconds already registered");

        Self { add_total, run_cost }
    }

    /// Count one accepted `add_job` call.
    pub fn record_add_total(&self, server_name: &str, job_key: &str, trace_id: &str) {
        let server_name = if server_name.is_empty() { FALLBACK_SERVER_NAME } else { server_name };
        let trace_id = if trace_id.is_empty() { FALLBACK_TRACE_ID } else { trace_id };
        self.add_total.with_label_values(&[server_name, job_key, trace_id]).inc();
    }

    /// Observe the wall duration of one handler invocation, in seconds.
    pub fn record_run_cost(&self, server_name: &str, job_key: &str, cost_seconds: f64) {
        let server_name = if server_name.is_empty() { FALLBACK_SERVER_NAME } else { server_name };
        self.run_cost.with_label_values(&[server_name, job_key]).observe(cost_seconds);
    }
}

/// The trace id of the current span as lowercase hex, or `"none"`.
pub(crate) fn current_trace_id() -> String {
    use opentelemetry::trace::TraceContextExt;

    let context = opentelemetry::Context::current();
    let span = context.span();
    let span_context = span.span_context();
    if span_context.is_valid() {
        span_context.trace_id().to_string()
    } else {
        FALLBACK_TRACE_ID.to_string()
    }
}
