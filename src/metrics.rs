use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Metric name prefix for all scheduled-job metrics
const PREFIX: &str = "booking_jobs";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Trigger side: one increment per cron tick, labelled published/skipped/error
    pub static ref TRIGGER_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_trigger_attempts_total"), "Scheduled trigger attempts by outcome"),
        &["job", "outcome"]
    ).expect("Failed to create trigger_attempts_total metric");

    pub static ref RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_runs_total"), "Consumed job runs by final status"),
        &["job", "status"]
    ).expect("Failed to create runs_total metric");

    pub static ref RUN_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_run_duration_seconds"),
            "Job run duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["job"]
    ).expect("Failed to create run_duration_seconds metric");

    pub static ref RECONCILED_RECORDS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_reconciled_records_total"), "Records transitioned by reconcilers"),
        &["job"]
    ).expect("Failed to create reconciled_records_total metric");

    pub static ref DEAD_LETTERS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_dead_letters_total"), "Work messages moved to the dead-letter queue"),
        &["job"]
    ).expect("Failed to create dead_letters_total metric");
}

/// Register all metrics with the registry. Safe to call more than once.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(TRIGGER_ATTEMPTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RUNS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RUN_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(RECONCILED_RECORDS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DEAD_LETTERS_TOTAL.clone()));

    tracing::info!("Metrics system initialized");
}

pub fn record_trigger_attempt(job: &str, outcome: &str) {
    TRIGGER_ATTEMPTS_TOTAL
        .with_label_values(&[job, outcome])
        .inc();
}

pub fn record_run(job: &str, status: &str, duration: Duration) {
    RUNS_TOTAL.with_label_values(&[job, status]).inc();
    RUN_DURATION_SECONDS
        .with_label_values(&[job])
        .observe(duration.as_secs_f64());
}

pub fn record_reconciled(job: &str, count: u64) {
    RECONCILED_RECORDS_TOTAL
        .with_label_values(&[job])
        .inc_by(count as f64);
}

pub fn record_dead_letter(job: &str) {
    DEAD_LETTERS_TOTAL.with_label_values(&[job]).inc();
}

/// Text exposition of every registered metric.
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
