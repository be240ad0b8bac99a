//! Prometheus metrics for the executor. Each server owns its own registry
//! so multiple instances can coexist in tests.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "iterator";

pub const ERR_STAGE_READ: &str = "read";
pub const ERR_STAGE_UNMARSHAL: &str = "unmarshal";
pub const ERR_STAGE_START: &str = "start";
pub const SIG_RESULT_OK: &str = "ok";
pub const SIG_RESULT_FAIL: &str = "fail";
pub const SIG_RESULT_START: &str = "start";

const SKIP_REASONS: [&str; 5] = ["nomatch", "nomax", "nofinger", "fingerunder", "fingerover"];

pub struct Metrics {
    registry: Registry,
    pub process_duration: Histogram,
    pub processes_current: IntGauge,
    pub errors: IntCounterVec,
    pub signalled: IntCounterVec,
    pub skipped: IntCounterVec,
}

impl Metrics {
    /// Build and register the full metric schema. Registration failure is a
    /// programming error and panics; this runs once at startup.
    pub fn new() -> Self {
        let registry = Registry::new();

        let process_duration = Histogram::with_opts(
            HistogramOpts::new("duration_seconds", "Time the processes handling alerts ran.")
                .namespace(NAMESPACE)
                .subsystem("process")
                .buckets(vec![1.0, 10.0, 60.0, 600.0, 900.0, 1800.0]),
        )
        .expect("failed to build process duration histogram");

        let processes_current = IntGauge::with_opts(
            Opts::new("current", "Current number of processes running.")
                .namespace(NAMESPACE)
                .subsystem("processes"),
        )
        .expect("failed to build current processes gauge");

        let errors = IntCounterVec::new(
            Opts::new("total", "Total number of errors while processing alerts.")
                .namespace(NAMESPACE)
                .subsystem("errors"),
            &["stage"],
        )
        .expect("failed to build error counter");

        let signalled = IntCounterVec::new(
            Opts::new(
                "total",
                "Total number of active processes signalled due to alarm resolving.",
            )
            .namespace(NAMESPACE)
            .subsystem("signalled"),
            &["result"],
        )
        .expect("failed to build signalled counter");

        let skipped = IntCounterVec::new(
            Opts::new(
                "total",
                "Total number of commands that were skipped instead of run for matching alerts.",
            )
            .namespace(NAMESPACE)
            .subsystem("skipped"),
            &["reason"],
        )
        .expect("failed to build skipped counter");

        registry
            .register(Box::new(process_duration.clone()))
            .expect("failed to register process duration histogram");
        registry
            .register(Box::new(processes_current.clone()))
            .expect("failed to register current processes gauge");
        registry
            .register(Box::new(errors.clone()))
            .expect("failed to register error counter");
        registry
            .register(Box::new(signalled.clone()))
            .expect("failed to register signalled counter");
        registry
            .register(Box::new(skipped.clone()))
            .expect("failed to register skipped counter");

        let metrics = Self {
            registry,
            process_duration,
            processes_current,
            errors,
            signalled,
            skipped,
        };
        metrics.init_labels();
        metrics
    }

    // Touch every label combination so a zero value is exposed before the
    // first increment.
    fn init_labels(&self) {
        for stage in [ERR_STAGE_READ, ERR_STAGE_UNMARSHAL, ERR_STAGE_START] {
            self.errors.with_label_values(&[stage]);
        }
        for result in [SIG_RESULT_OK, SIG_RESULT_FAIL, SIG_RESULT_START] {
            self.signalled.with_label_values(&[result]);
        }
        for reason in SKIP_REASONS {
            self.skipped.with_label_values(&[reason]);
        }
    }

    /// Render the registry in the text exposition format.
    pub fn gather(&self) -> String {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
