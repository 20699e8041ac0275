// Prometheus metrics, registered once in the default registry

use assay_common::types::{CodeExecutionResponse, TestCategory};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    static ref EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "assay_executions_total",
        "Execution requests by response status",
        &["status"]
    )
    .expect("executions counter can be registered");
    static ref TEST_CASES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "assay_test_cases_total",
        "Graded test cases by outcome",
        &["outcome"]
    )
    .expect("test case counter can be registered");
    static ref PLAGIARISM_FLAGGED_TOTAL: IntCounter = register_int_counter!(
        "assay_plagiarism_flagged_total",
        "Requests whose plagiarism report was flagged"
    )
    .expect("plagiarism counter can be registered");
    static ref REQUEST_DURATION_SECONDS: Histogram = register_histogram!(
        "assay_request_duration_seconds",
        "Wall time of execute requests",
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .expect("duration histogram can be registered");
    static ref SANDBOX_RUNS_IN_FLIGHT: IntGauge = register_int_gauge!(
        "assay_sandbox_runs_in_flight",
        "Sandbox runs currently holding an admission slot"
    )
    .expect("in-flight gauge can be registered");
}

pub fn record_execution(response: &CodeExecutionResponse, elapsed: Duration) {
    EXECUTIONS_TOTAL
        .with_label_values(&[&response.status.to_string()])
        .inc();
    REQUEST_DURATION_SECONDS.observe(elapsed.as_secs_f64());

    for category in TestCategory::ALL {
        for result in response.results(category) {
            TEST_CASES_TOTAL
                .with_label_values(&[&result.status.to_string()])
                .inc();
        }
    }
    if response.plagiarism_report.flagged {
        PLAGIARISM_FLAGGED_TOTAL.inc();
    }
}

/// Text exposition of every registered metric
pub fn render(runs_in_flight: usize) -> Result<String, String> {
    SANDBOX_RUNS_IN_FLIGHT.set(runs_in_flight as i64);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}
