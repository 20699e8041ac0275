//! End-to-end tests for the orchestrator
//!
//! A scripted `Sandbox` stands in for containers: it counts invocations and
//! answers according to markers in the submitted source, so every request
//! path runs without Docker. The `#[ignore]` tests at the bottom use the
//! process backend and need `python3` on the host.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assay_common::config::EngineSettings;
use assay_common::types::{
    ErrorClass, ExecutionRequest, PeerSubmission, ResponseStatus, TestCase, TestStatus,
};
use async_trait::async_trait;

use crate::error::{InputError, SandboxError};
use crate::gate::AdmissionGate;
use crate::orchestrator::Orchestrator;
use crate::registry::LanguageRegistry;
use crate::sandbox::{ProcessSandbox, RunJob, RunOutcome, Sandbox};

/// Behaves like a tiny interpreter keyed on the source text
#[derive(Default)]
struct ScriptedSandbox {
    calls: AtomicUsize,
}

impl ScriptedSandbox {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, job: &RunJob) -> Result<RunOutcome, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let source: &str = &job.source;

        if source.contains("sleep") {
            return Ok(RunOutcome {
                stdout: "partial\n".to_string(),
                timed_out: true,
                wall_time_ms: job.limits.timeout.as_millis() as u64,
                ..Default::default()
            });
        }
        if source.contains("hang") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if source.contains("flaky") && job.stdin == "broken" {
            return Err(SandboxError::Infrastructure("docker daemon went away".to_string()));
        }
        if source.contains("down") {
            return Err(SandboxError::Setup("image pull failed".to_string()));
        }

        let stdout = if source.contains("print(1+1)") {
            "2\n".to_string()
        } else {
            // Echo programs: stdout mirrors stdin
            job.stdin.clone()
        };
        Ok(RunOutcome {
            stdout,
            exit_code: Some(0),
            wall_time_ms: 12,
            peak_memory_kb: 2048,
            ..Default::default()
        })
    }
}

fn orchestrator_with(sandbox: Arc<ScriptedSandbox>, settings: EngineSettings) -> Orchestrator {
    let gate = AdmissionGate::new(settings.max_concurrent_runs);
    Orchestrator::new(Arc::new(LanguageRegistry::builtin()), sandbox, gate, settings)
}

fn orchestrator(sandbox: Arc<ScriptedSandbox>) -> Orchestrator {
    orchestrator_with(sandbox, EngineSettings::default())
}

fn case(input: &str, expected_output: &str, weight: u32) -> TestCase {
    TestCase {
        input: input.to_string(),
        expected_output: expected_output.to_string(),
        weight,
    }
}

fn request(code: &str, basic: Vec<TestCase>) -> ExecutionRequest {
    ExecutionRequest {
        code: code.to_string(),
        language: "python".to_string(),
        test_cases_basic: basic,
        test_cases_advanced: Vec::new(),
        test_cases_custom: Vec::new(),
        peer_submissions: Vec::new(),
        timeout: None,
    }
}

fn peer(id: &str, code: &str) -> PeerSubmission {
    PeerSubmission {
        user_id: format!("u{id}"),
        submission_id: id.to_string(),
        code: code.to_string(),
    }
}

#[tokio::test]
async fn test_print_one_plus_one_scores_full_marks() {
    let sandbox = Arc::new(ScriptedSandbox::default());
    let response = orchestrator(sandbox.clone())
        .execute(request("print(1+1)", vec![case("", "2", 1)]))
        .await
        .unwrap();

    assert_eq!(response.status, ResponseStatus::Completed);
    assert_eq!(response.error, None);
    assert_eq!(response.execution_summary.passed_test_cases, 1);
    assert_eq!(response.execution_summary.total_test_cases, 1);
    assert_eq!(response.execution_summary.score_percent, 100.0);
    assert_eq!(response.test_cases_basic[0].status, TestStatus::Passed);
    assert!(!response.plagiarism_report.flagged);
    assert_eq!(response.plagiarism_report.max_similarity, 0.0);
    assert!(response.plagiarism_report.matches.is_empty());
    assert_eq!(sandbox.calls(), 1);
}

#[tokio::test]
async fn test_timed_out_case_never_passes() {
    let sandbox = Arc::new(ScriptedSandbox::default());
    let response = orchestrator(sandbox)
        .execute(request("import time\ntime.sleep(60)", vec![case("", "partial", 1)]))
        .await
        .unwrap();

    let result = &response.test_cases_basic[0];
    assert!(result.timed_out);
    assert_eq!(result.status, TestStatus::TimeLimitExceeded);
    assert_eq!(response.execution_summary.passed_test_cases, 0);
    assert!(response.execution_summary.score_percent < 100.0);
    // A failing verdict is not an engine error
    assert_eq!(response.status, ResponseStatus::Completed);
}

#[tokio::test]
async fn test_empty_request_is_rejected_without_sandbox_use() {
    let sandbox = Arc::new(ScriptedSandbox::default());
    let result = orchestrator(sandbox.clone())
        .execute(request("print(1+1)", Vec::new()))
        .await;

    assert_eq!(result.unwrap_err(), InputError::NoTestCases);
    assert_eq!(sandbox.calls(), 0);
}

#[tokio::test]
async fn test_unsupported_language_is_rejected() {
    let sandbox = Arc::new(ScriptedSandbox::default());
    let mut req = request("print(1+1)", vec![case("", "2", 1)]);
    req.language = "cobol".to_string();

    let response = orchestrator(sandbox.clone()).respond(req).await;
    assert_eq!(response.status, ResponseStatus::Rejected);
    assert_eq!(response.error_class(), Some(ErrorClass::InputError));
    assert!(response.error.unwrap().contains("cobol"));
    assert_eq!(sandbox.calls(), 0);
}

#[tokio::test]
async fn test_language_lookup_ignores_case() {
    let sandbox = Arc::new(ScriptedSandbox::default());
    let mut req = request("print(1+1)", vec![case("", "2", 1)]);
    req.language = "Python".to_string();

    let response = orchestrator(sandbox).execute(req).await.unwrap();
    assert_eq!(response.language, "python");
}

#[tokio::test]
async fn test_validation_rules() {
    let sandbox = Arc::new(ScriptedSandbox::default());
    let orchestrator = orchestrator(sandbox.clone());

    let blank = request("  \n", vec![case("", "", 1)]);
    assert_eq!(orchestrator.execute(blank).await.unwrap_err(), InputError::EmptySource);

    let weightless = request("print(1)", vec![case("", "1", 1), case("", "1", 0)]);
    assert_eq!(
        orchestrator.execute(weightless).await.unwrap_err(),
        InputError::ZeroWeight {
            category: "basic".to_string(),
            index: 1
        }
    );

    let mut zero_timeout = request("print(1)", vec![case("", "1", 1)]);
    zero_timeout.timeout = Some(0);
    assert_eq!(
        orchestrator.execute(zero_timeout).await.unwrap_err(),
        InputError::ZeroTimeout
    );

    let mut dup_peers = request("print(1)", vec![case("", "1", 1)]);
    dup_peers.peer_submissions = vec![peer("7", "a"), peer("7", "b")];
    assert_eq!(
        orchestrator.execute(dup_peers).await.unwrap_err(),
        InputError::DuplicatePeer("7".to_string())
    );

    let huge = request(&"x".repeat(70 * 1024), vec![case("", "1", 1)]);
    assert!(matches!(
        orchestrator.execute(huge).await.unwrap_err(),
        InputError::SourceTooLarge { .. }
    ));

    let mut big_input = request("print(1)", Vec::new());
    big_input.test_cases_custom = vec![case(&"1".repeat(70 * 1024), "1", 1)];
    assert!(matches!(
        orchestrator.execute(big_input).await.unwrap_err(),
        InputError::InputTooLarge { index: 0, .. }
    ));

    assert_eq!(sandbox.calls(), 0);
}

#[tokio::test]
async fn test_identical_peers_are_flagged() {
    let code = "n = int(input())\nprint(n * 2)\n";
    let mut req = request(code, vec![case("4", "4", 1)]);
    req.peer_submissions = vec![peer("a", code), peer("b", code)];

    let sandbox = Arc::new(ScriptedSandbox::default());
    let response = orchestrator(sandbox.clone()).execute(req).await.unwrap();

    let report = &response.plagiarism_report;
    assert!(report.flagged);
    assert_eq!(report.max_similarity, 1.0);
    assert_eq!(report.matches.len(), 2);
    assert_eq!(report.matches[0].similarity, 1.0);
    // Static comparison only: one run for the single test case
    assert_eq!(sandbox.calls(), 1);
}

#[tokio::test]
async fn test_grading_is_deterministic() {
    let sandbox = Arc::new(ScriptedSandbox::default());
    let orchestrator = orchestrator(sandbox);
    let build = || {
        let mut req = request(
            "echo",
            vec![case("a", "a", 3), case("b", "c", 2), case("d \n", "d", 1)],
        );
        req.test_cases_advanced = vec![case("x", "y", 4)];
        req
    };

    let first = orchestrator.execute(build()).await.unwrap();
    let second = orchestrator.execute(build()).await.unwrap();
    assert_eq!(first.execution_summary, second.execution_summary);
    assert_eq!(first.execution_summary.score_percent, 40.0);
    assert_ne!(first.request_id, second.request_id);
}

#[tokio::test]
async fn test_categories_keep_their_order() {
    let sandbox = Arc::new(ScriptedSandbox::default());
    let mut req = request("echo", vec![case("1", "1", 1), case("2", "2", 1)]);
    req.test_cases_advanced = vec![case("3", "3", 1)];
    req.test_cases_custom = vec![case("4", "4", 1), case("5", "5", 1), case("6", "6", 1)];

    let response = orchestrator(sandbox).execute(req).await.unwrap();

    let outputs = |results: &[assay_common::types::TestCaseResult]| {
        results
            .iter()
            .map(|r| r.actual_output.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(outputs(&response.test_cases_basic), vec!["1", "2"]);
    assert_eq!(outputs(&response.test_cases_advanced), vec!["3"]);
    assert_eq!(outputs(&response.test_cases_custom), vec!["4", "5", "6"]);
    assert_eq!(response.execution_summary.total_test_cases, 6);
}

#[tokio::test]
async fn test_partial_infrastructure_failure_keeps_results() {
    let sandbox = Arc::new(ScriptedSandbox::default());
    let mut req = request("flaky", vec![case("ok", "ok", 1), case("broken", "broken", 1)]);
    req.peer_submissions = vec![peer("p", "flaky")];

    let response = orchestrator(sandbox).execute(req).await.unwrap();

    assert_eq!(response.status, ResponseStatus::Partial);
    assert_eq!(
        response.error_class(),
        Some(ErrorClass::SandboxInfrastructureFailure)
    );
    assert_eq!(response.test_cases_basic[0].status, TestStatus::Passed);
    assert_eq!(response.test_cases_basic[1].status, TestStatus::InternalError);
    assert_eq!(response.execution_summary.score_percent, 50.0);
    // Plagiarism results survive a grading failure
    assert!(response.plagiarism_report.flagged);
}

#[tokio::test]
async fn test_total_infrastructure_failure_is_failed() {
    let sandbox = Arc::new(ScriptedSandbox::default());
    let response = orchestrator(sandbox)
        .execute(request("down", vec![case("", "", 1), case("", "", 1)]))
        .await
        .unwrap();

    assert_eq!(response.status, ResponseStatus::Failed);
    assert!(response
        .error
        .unwrap()
        .starts_with("sandbox_infrastructure_failure: "));
    assert_eq!(response.test_cases_basic.len(), 2);
}

#[tokio::test]
async fn test_request_deadline_cancels_in_flight_runs() {
    let sandbox = Arc::new(ScriptedSandbox::default());
    let settings = EngineSettings {
        max_timeout_ms: 100,
        request_deadline_ms: 200,
        ..Default::default()
    };
    let started = std::time::Instant::now();
    let response = orchestrator_with(sandbox, settings)
        .execute(request("hang", vec![case("", "", 1), case("", "", 1)]))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(response.error_class(), Some(ErrorClass::RequestTimeout));
    assert_eq!(response.status, ResponseStatus::Failed);
    assert!(response
        .test_cases_basic
        .iter()
        .all(|r| r.status == TestStatus::Cancelled));
}

#[tokio::test]
async fn test_oversized_peer_is_noted_not_fatal() {
    let sandbox = Arc::new(ScriptedSandbox::default());
    let mut req = request("print(1+1)", vec![case("", "2", 1)]);
    req.peer_submissions = vec![peer("big", &"y = 1\n".repeat(20_000)), peer("same", "print(1+1)")];

    let response = orchestrator(sandbox).execute(req).await.unwrap();

    assert_eq!(response.status, ResponseStatus::Partial);
    assert_eq!(response.error_class(), Some(ErrorClass::ComparisonError));
    assert_eq!(response.plagiarism_report.failures[0].peer_id, "big");
    assert_eq!(response.plagiarism_report.matches[0].peer_id, "same");
    assert_eq!(response.execution_summary.score_percent, 100.0);
}

fn process_orchestrator() -> Orchestrator {
    let settings = EngineSettings::default();
    Orchestrator::new(
        Arc::new(LanguageRegistry::builtin()),
        Arc::new(ProcessSandbox::new()),
        AdmissionGate::new(settings.max_concurrent_runs),
        settings,
    )
}

#[tokio::test]
#[ignore = "requires python3 on the host"]
async fn test_python_end_to_end_with_process_backend() {
    let response = process_orchestrator()
        .execute(request(
            "n = int(input())\nprint(n * 2)\n",
            vec![case("5", "10", 1), case("21", "42", 1), case("1", "3", 2)],
        ))
        .await
        .unwrap();

    assert_eq!(response.execution_summary.passed_test_cases, 2);
    assert_eq!(response.execution_summary.score_percent, 50.0);
    assert_eq!(response.test_cases_basic[2].status, TestStatus::WrongAnswer);
}

#[tokio::test]
#[ignore = "requires python3 on the host"]
async fn test_python_sleep_times_out_with_process_backend() {
    let mut req = request("import time\ntime.sleep(10)\n", vec![case("", "", 1)]);
    req.timeout = Some(1);

    let response = process_orchestrator().execute(req).await.unwrap();
    assert!(response.test_cases_basic[0].timed_out);
    assert_eq!(response.execution_summary.score_percent, 0.0);
}
