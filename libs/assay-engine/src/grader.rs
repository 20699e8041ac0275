// Grader - runs every test case through the sandbox and scores the outcomes.
//
// Cases from all three categories share one bounded stream so per-request
// parallelism never exceeds `max_parallel_cases`; each run additionally holds
// an admission gate permit. `buffered` yields in input order, so results keep
// their category and index order regardless of completion order.

use std::sync::Arc;

use assay_common::types::{
    ExecutionSummary, TestCase, TestCaseResult, TestCategory, TestStatus,
};
use futures_util::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SandboxError;
use crate::evaluator::{evaluate_case, summarize, CaseRun};
use crate::gate::AdmissionGate;
use crate::registry::LanguageConfig;
use crate::sandbox::{RunJob, RunLimits, Sandbox};

/// Per-category results plus the folded summary
#[derive(Debug, Clone, Default)]
pub struct GradeReport {
    pub basic: Vec<TestCaseResult>,
    pub advanced: Vec<TestCaseResult>,
    pub custom: Vec<TestCaseResult>,
    pub summary: ExecutionSummary,
}

impl GradeReport {
    pub fn results(&self, category: TestCategory) -> &[TestCaseResult] {
        match category {
            TestCategory::Basic => &self.basic,
            TestCategory::Advanced => &self.advanced,
            TestCategory::Custom => &self.custom,
        }
    }

    fn results_mut(&mut self, category: TestCategory) -> &mut Vec<TestCaseResult> {
        match category {
            TestCategory::Basic => &mut self.basic,
            TestCategory::Advanced => &mut self.advanced,
            TestCategory::Custom => &mut self.custom,
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &TestCaseResult> {
        self.basic.iter().chain(&self.advanced).chain(&self.custom)
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.all().filter(|r| r.status == status).count()
    }

    /// First execution-context failure, if any case hit one
    pub fn infrastructure_error(&self) -> Option<&str> {
        self.all()
            .find(|r| r.status == TestStatus::InternalError)
            .and_then(|r| r.error.as_deref())
    }

    /// Cases that produced a verdict on the submitted code
    pub fn graded(&self) -> usize {
        self.all()
            .filter(|r| !matches!(r.status, TestStatus::InternalError | TestStatus::Cancelled))
            .count()
    }
}

/// Source, language and limits shared by every case of one request
#[derive(Debug, Clone)]
pub struct GradeJob<'a> {
    pub language: Arc<LanguageConfig>,
    pub source: Arc<str>,
    pub limits: RunLimits,
    pub basic: &'a [TestCase],
    pub advanced: &'a [TestCase],
    pub custom: &'a [TestCase],
    pub deadline: Instant,
}

impl GradeJob<'_> {
    fn cases(&self, category: TestCategory) -> &[TestCase] {
        match category {
            TestCategory::Basic => self.basic,
            TestCategory::Advanced => self.advanced,
            TestCategory::Custom => self.custom,
        }
    }
}

#[derive(Clone)]
pub struct Grader {
    sandbox: Arc<dyn Sandbox>,
    gate: AdmissionGate,
    max_parallel_cases: usize,
}

impl Grader {
    pub fn new(sandbox: Arc<dyn Sandbox>, gate: AdmissionGate, max_parallel_cases: usize) -> Self {
        Self {
            sandbox,
            gate,
            max_parallel_cases: max_parallel_cases.max(1),
        }
    }

    pub async fn grade(&self, job: &GradeJob<'_>) -> GradeReport {
        let started = Instant::now();
        // Owned (category, index) pairs keep the stream future `Send` for axum
        let work: Vec<(TestCategory, usize)> = TestCategory::ALL
            .into_iter()
            .flat_map(|category| (0..job.cases(category).len()).map(move |index| (category, index)))
            .collect();

        let results: Vec<(TestCategory, TestCaseResult)> = stream::iter(work)
            .map(|(category, index)| async move {
                let case = &job.cases(category)[index];
                let run = self.run_case(job, case).await;
                let result = evaluate_case(index, case, run);
                debug!(
                    category = %category,
                    index,
                    status = %result.status,
                    runtime_ms = result.runtime_ms,
                    "Test case graded"
                );
                (category, result)
            })
            .buffered(self.max_parallel_cases)
            .collect()
            .await;

        let mut report = GradeReport::default();
        for (category, result) in results {
            report.results_mut(category).push(result);
        }
        report.summary = summarize(report.all());

        info!(
            language = %job.language.name,
            backend = self.sandbox.name(),
            passed = report.summary.passed_test_cases,
            total = report.summary.total_test_cases,
            score_percent = report.summary.score_percent,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Grading finished"
        );
        report
    }

    async fn run_case(&self, job: &GradeJob<'_>, case: &TestCase) -> CaseRun {
        let run = RunJob::new(
            job.language.clone(),
            job.source.clone(),
            case.input.clone(),
            job.limits.clone(),
        );

        // Dropping this future at the deadline tears the sandbox down
        let attempt = async {
            let _permit = self.gate.acquire(job.deadline).await?;
            self.sandbox.run(&run).await
        };

        match tokio::time::timeout_at(job.deadline, attempt).await {
            Ok(Ok(outcome)) => CaseRun::Finished(outcome),
            Ok(Err(SandboxError::AdmissionTimeout)) | Err(_) => CaseRun::Cancelled,
            Ok(Err(e)) => {
                warn!(run_id = %run.run_id, error = %e, "Sandbox run failed");
                CaseRun::InternalError(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::RunOutcome;
    use assay_common::config::EngineSettings;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Echoes stdin back after a delay derived from the input
    struct EchoSandbox {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl EchoSandbox {
        fn new() -> Self {
            Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Sandbox for EchoSandbox {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn run(&self, job: &RunJob) -> Result<RunOutcome, SandboxError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let outcome = match job.stdin.as_str() {
                "boom" => Err(SandboxError::Setup("no container for you".to_string())),
                input => {
                    let delay: u64 = input.trim().parse().unwrap_or(1);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(RunOutcome {
                        stdout: job.stdin.clone(),
                        exit_code: Some(0),
                        wall_time_ms: delay,
                        ..Default::default()
                    })
                }
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn case(input: &str) -> TestCase {
        TestCase {
            input: input.to_string(),
            expected_output: input.to_string(),
            weight: 1,
        }
    }

    fn grade_job<'a>(
        basic: &'a [TestCase],
        advanced: &'a [TestCase],
        custom: &'a [TestCase],
        deadline: Duration,
    ) -> GradeJob<'a> {
        let language = crate::registry::LanguageRegistry::builtin()
            .lookup("python")
            .unwrap();
        let limits = RunLimits::resolve(&language, &EngineSettings::default(), None);
        GradeJob {
            language,
            source: Arc::from("print(input())"),
            limits,
            basic,
            advanced,
            custom,
            deadline: Instant::now() + deadline,
        }
    }

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let sandbox = Arc::new(EchoSandbox::new());
        let grader = Grader::new(sandbox, AdmissionGate::new(8), 4);
        let basic = vec![case("40"), case("1"), case("20")];
        let custom = vec![case("5"), case("30")];

        let report = grader
            .grade(&grade_job(&basic, &[], &custom, Duration::from_secs(5)))
            .await;

        let inputs: Vec<_> = report.basic.iter().map(|r| r.actual_output.as_str()).collect();
        assert_eq!(inputs, vec!["40", "1", "20"]);
        assert_eq!(report.basic.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(report.custom[1].actual_output, "30");
        assert!(report.advanced.is_empty());
        assert_eq!(report.summary.score_percent, 100.0);
        assert_eq!(report.summary.runtime_ms, 40);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let sandbox = Arc::new(EchoSandbox::new());
        let grader = Grader::new(sandbox.clone(), AdmissionGate::new(8), 2);
        let basic: Vec<_> = (0..6).map(|_| case("15")).collect();

        grader
            .grade(&grade_job(&basic, &[], &[], Duration::from_secs(5)))
            .await;
        assert!(sandbox.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_gate_bounds_across_graders() {
        let sandbox = Arc::new(EchoSandbox::new());
        let gate = AdmissionGate::new(1);
        let a = Grader::new(sandbox.clone(), gate.clone(), 4);
        let b = Grader::new(sandbox.clone(), gate, 4);
        let basic: Vec<_> = (0..3).map(|_| case("10")).collect();
        let job_a = grade_job(&basic, &[], &[], Duration::from_secs(5));
        let job_b = grade_job(&basic, &[], &[], Duration::from_secs(5));

        tokio::join!(a.grade(&job_a), b.grade(&job_b));
        assert_eq!(sandbox.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_is_contained() {
        let grader = Grader::new(Arc::new(EchoSandbox::new()), AdmissionGate::new(4), 4);
        let basic = vec![case("1"), case("boom"), case("2")];

        let report = grader
            .grade(&grade_job(&basic, &[], &[], Duration::from_secs(5)))
            .await;

        assert_eq!(report.basic[1].status, TestStatus::InternalError);
        assert_eq!(report.basic[0].status, TestStatus::Passed);
        assert_eq!(report.basic[2].status, TestStatus::Passed);
        assert_eq!(report.graded(), 2);
        assert!(report.infrastructure_error().unwrap().contains("no container"));
    }

    #[tokio::test]
    async fn test_deadline_cancels_unfinished_cases() {
        let grader = Grader::new(Arc::new(EchoSandbox::new()), AdmissionGate::new(4), 1);
        let basic = vec![case("5"), case("5000"), case("5")];

        let report = grader
            .grade(&grade_job(&basic, &[], &[], Duration::from_millis(300)))
            .await;

        assert_eq!(report.basic[0].status, TestStatus::Passed);
        assert_eq!(report.basic[1].status, TestStatus::Cancelled);
        assert_eq!(report.basic[2].status, TestStatus::Cancelled);
        assert_eq!(report.count(TestStatus::Cancelled), 2);
        assert_eq!(report.summary.total_test_cases, 3);
    }
}
