//! Test Evaluator - pure scoring of raw run outcomes
//!
//! Knows nothing about containers, processes or language runtimes: it maps
//! `(RunOutcome, TestCase)` to a `TestCaseResult` and folds results into an
//! `ExecutionSummary`. The same outcomes always produce the same score.
//!
//! **Normalization rules (all languages):**
//! - `\r\n` is read as `\n`
//! - trailing whitespace on every line is ignored
//! - trailing blank lines are ignored
//! - leading whitespace, inner blank lines and case are significant
//!
//! Only stdout is judged. Stderr is capped like stdout, but overflowing it
//! never fails a case. A compile failure is a flag set by the sandbox's
//! separate compile step, never inferred from an exit code, so a program
//! may exit with any status. The container backend reports a signal death
//! as exit status `128 + n` rather than as a signal.

use crate::sandbox::RunOutcome;
use assay_common::types::{ExecutionSummary, TestCase, TestCaseResult, TestStatus};

/// How one test case's run ended, as seen by the grader
#[derive(Debug, Clone)]
pub enum CaseRun {
    Finished(RunOutcome),
    /// The execution context failed; the case gets no verdict on the code
    InternalError(String),
    /// Dropped at the request deadline before it finished
    Cancelled,
}

pub fn normalize_output(output: &str) -> String {
    let lines: Vec<&str> = output
        .split('\n')
        .map(|line| line.trim_end())
        .collect();
    let keep = lines
        .iter()
        .rposition(|line| !line.is_empty())
        .map_or(0, |last| last + 1);
    lines[..keep].join("\n")
}

pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}

/// Status for a finished run, first matching rule wins
fn classify(outcome: &RunOutcome, expected: &str) -> TestStatus {
    if outcome.compile_failed {
        TestStatus::CompilationError
    } else if outcome.timed_out {
        TestStatus::TimeLimitExceeded
    } else if outcome.memory_exceeded {
        TestStatus::MemoryLimitExceeded
    } else if outcome.output_truncated {
        TestStatus::OutputLimitExceeded
    } else if !outcome.exited_cleanly() {
        TestStatus::RuntimeError
    } else if outputs_match(&outcome.stdout, expected) {
        TestStatus::Passed
    } else {
        TestStatus::WrongAnswer
    }
}

pub fn evaluate_case(index: usize, case: &TestCase, run: CaseRun) -> TestCaseResult {
    let mut result = TestCaseResult {
        index,
        weight: case.weight,
        status: TestStatus::InternalError,
        passed: false,
        expected_output: case.expected_output.clone(),
        actual_output: String::new(),
        stderr: String::new(),
        exit_code: None,
        timed_out: false,
        runtime_ms: 0,
        memory_kb: 0,
        error: None,
    };

    match run {
        CaseRun::InternalError(message) => {
            result.error = Some(message);
        }
        CaseRun::Cancelled => {
            result.status = TestStatus::Cancelled;
            result.error = Some("request deadline exceeded before the case finished".to_string());
        }
        CaseRun::Finished(outcome) => {
            result.status = classify(&outcome, &case.expected_output);
            result.passed = result.status == TestStatus::Passed;
            result.exit_code = outcome.exit_code;
            result.timed_out = outcome.timed_out;
            result.runtime_ms = outcome.wall_time_ms;
            result.memory_kb = outcome.peak_memory_kb;
            result.actual_output = outcome.stdout;
            result.stderr = outcome.stderr;
            if let Some(signal) = outcome.signal {
                result.error = Some(format!("terminated by signal {signal}"));
            }
        }
    }

    result
}

/// Round to two decimals, the precision `score_percent` is reported at
pub fn round_percent(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Fold per-case results into the request summary
///
/// Runtime and memory are maxima across runs, not sums.
pub fn summarize<'a>(results: impl IntoIterator<Item = &'a TestCaseResult>) -> ExecutionSummary {
    let mut summary = ExecutionSummary::default();
    let mut total_weight = 0u64;
    let mut passed_weight = 0u64;

    for result in results {
        summary.total_test_cases += 1;
        total_weight += u64::from(result.weight);
        if result.passed {
            summary.passed_test_cases += 1;
            passed_weight += u64::from(result.weight);
        }
        summary.runtime_ms = summary.runtime_ms.max(result.runtime_ms);
        summary.peak_memory_kb = summary.peak_memory_kb.max(result.memory_kb);
    }

    if total_weight == 0 {
        summary.degenerate = true;
        summary.score_percent = 0.0;
    } else {
        summary.score_percent =
            round_percent(100.0 * passed_weight as f64 / total_weight as f64);
    }
    summary
}
