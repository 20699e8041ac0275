//! Execution Orchestrator - the single entry point for one grading request
//!
//! **Lifecycle:**
//! `Received → Validated → Grading → PlagiarismCheck → Assembled → Returned`,
//! with `Failed` reachable from validation. Grading and plagiarism run as
//! independent tasks joined before assembly; a failure in one never blanks
//! the other's results.
//!
//! **Error field precedence:** request timeout, then sandbox infrastructure
//! failure, then comparison error. `status` is `completed` without an
//! error, `partial` when at least one case was graded, `failed` otherwise.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use assay_common::config::EngineSettings;
use assay_common::types::{
    CodeExecutionResponse, ErrorClass, ExecutionRequest, PlagiarismReport, ResponseStatus,
    TestCategory, TestStatus,
};
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::InputError;
use crate::gate::AdmissionGate;
use crate::grader::{GradeJob, Grader};
use crate::plagiarism::{self, PlagiarismConfig};
use crate::registry::{LanguageConfig, LanguageRegistry};
use crate::sandbox::{RunLimits, Sandbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    Grading,
    PlagiarismCheck,
    Assembled,
    Returned,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Received => "received",
            Stage::Validated => "validated",
            Stage::Grading => "grading",
            Stage::PlagiarismCheck => "plagiarism_check",
            Stage::Assembled => "assembled",
            Stage::Returned => "returned",
            Stage::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Why the plagiarism task produced no report
enum PlagiarismFailure {
    DeadlineExceeded,
    Crashed(String),
}

#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<LanguageRegistry>,
    grader: Grader,
    settings: Arc<EngineSettings>,
    plagiarism: PlagiarismConfig,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        sandbox: Arc<dyn Sandbox>,
        gate: AdmissionGate,
        settings: EngineSettings,
    ) -> Self {
        let grader = Grader::new(sandbox, gate, settings.max_parallel_cases);
        Self {
            registry,
            grader,
            plagiarism: PlagiarismConfig::from_settings(&settings),
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Like `execute`, but validation failures become a `rejected` response
    pub async fn respond(&self, request: ExecutionRequest) -> CodeExecutionResponse {
        let language = request.language.clone();
        match self.execute(request).await {
            Ok(response) => response,
            Err(e) => CodeExecutionResponse::rejected(&language, e),
        }
    }

    #[tracing::instrument(
        skip(self, request),
        fields(
            request_id = tracing::field::Empty,
            language = %request.language,
            test_count = request.total_test_cases(),
            peer_count = request.peer_submissions.len(),
        )
    )]
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<CodeExecutionResponse, InputError> {
        let request_id = Uuid::new_v4();
        tracing::Span::current().record("request_id", tracing::field::display(request_id));
        let started = Instant::now();
        debug!(stage = %Stage::Received, "Request received");

        let language = match self.validate(&request) {
            Ok(language) => language,
            Err(e) => {
                warn!(stage = %Stage::Failed, error = %e, "Request rejected");
                return Err(e);
            }
        };
        debug!(stage = %Stage::Validated, "Request validated");

        let deadline = started + Duration::from_millis(self.settings.request_deadline_ms);
        let source: Arc<str> = Arc::from(request.code.as_str());
        let grade_job = GradeJob {
            limits: RunLimits::resolve(&language, &self.settings, request.timeout),
            language: language.clone(),
            source,
            basic: &request.test_cases_basic,
            advanced: &request.test_cases_advanced,
            custom: &request.test_cases_custom,
            deadline,
        };

        let grading = async {
            debug!(stage = %Stage::Grading, "Grading started");
            self.grader.grade(&grade_job).await
        };
        let plagiarism_check = async {
            debug!(stage = %Stage::PlagiarismCheck, "Plagiarism check started");
            self.check_plagiarism(&request, &language, deadline).await
        };
        let (grade, plagiarism_result) = tokio::join!(grading, plagiarism_check);

        let mut errors: Vec<(ErrorClass, String)> = Vec::new();
        let cancelled = grade.count(TestStatus::Cancelled);
        let plagiarism_report = match plagiarism_result {
            Ok(report) => report,
            Err(PlagiarismFailure::DeadlineExceeded) => {
                errors.push((
                    ErrorClass::RequestTimeout,
                    "plagiarism check did not finish before the request deadline".to_string(),
                ));
                PlagiarismReport::empty(self.plagiarism.threshold)
            }
            Err(PlagiarismFailure::Crashed(message)) => {
                errors.push((ErrorClass::ComparisonError, message));
                PlagiarismReport::empty(self.plagiarism.threshold)
            }
        };
        if cancelled > 0 {
            errors.push((
                ErrorClass::RequestTimeout,
                format!(
                    "request deadline of {} ms exceeded; {cancelled} test case(s) cancelled",
                    self.settings.request_deadline_ms
                ),
            ));
        }
        if let Some(message) = grade.infrastructure_error() {
            errors.push((ErrorClass::SandboxInfrastructureFailure, message.to_string()));
        }
        if let Some(failure) = plagiarism_report.failures.first() {
            errors.push((
                ErrorClass::ComparisonError,
                format!(
                    "{} peer comparison(s) failed; first: {}: {}",
                    plagiarism_report.failures.len(),
                    failure.peer_id,
                    failure.message
                ),
            ));
        }

        let error = errors
            .into_iter()
            .min_by_key(|(class, _)| error_rank(*class))
            .map(|(class, message)| class.with_message(message));
        let status = match (&error, grade.graded()) {
            (None, _) => ResponseStatus::Completed,
            (Some(_), 0) => ResponseStatus::Failed,
            (Some(_), _) => ResponseStatus::Partial,
        };

        let response = CodeExecutionResponse {
            request_id,
            status,
            language: language.name.clone(),
            test_cases_basic: grade.results(TestCategory::Basic).to_vec(),
            test_cases_advanced: grade.results(TestCategory::Advanced).to_vec(),
            test_cases_custom: grade.results(TestCategory::Custom).to_vec(),
            execution_summary: grade.summary,
            plagiarism_report,
            error,
            completed_at: Utc::now(),
        };
        debug!(stage = %Stage::Assembled, "Response assembled");

        info!(
            stage = %Stage::Returned,
            status = %response.status,
            score_percent = response.execution_summary.score_percent,
            flagged = response.plagiarism_report.flagged,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request finished"
        );
        Ok(response)
    }

    fn validate(&self, request: &ExecutionRequest) -> Result<Arc<LanguageConfig>, InputError> {
        let language = self.registry.lookup(&request.language)?;

        if request.code.trim().is_empty() {
            return Err(InputError::EmptySource);
        }
        if request.code.len() > self.settings.max_source_bytes {
            return Err(InputError::SourceTooLarge {
                limit: self.settings.max_source_bytes,
            });
        }
        if request.total_test_cases() == 0 {
            return Err(InputError::NoTestCases);
        }
        if request.timeout == Some(0) {
            return Err(InputError::ZeroTimeout);
        }

        for category in TestCategory::ALL {
            for (index, case) in request.cases(category).iter().enumerate() {
                if case.weight == 0 {
                    return Err(InputError::ZeroWeight {
                        category: category.to_string(),
                        index,
                    });
                }
                if case.input.len() > self.settings.max_stdin_bytes {
                    return Err(InputError::InputTooLarge {
                        category: category.to_string(),
                        index,
                        limit: self.settings.max_stdin_bytes,
                    });
                }
            }
        }

        let mut seen = HashSet::new();
        for peer in &request.peer_submissions {
            if !seen.insert(peer.submission_id.as_str()) {
                return Err(InputError::DuplicatePeer(peer.submission_id.clone()));
            }
        }

        Ok(language)
    }

    async fn check_plagiarism(
        &self,
        request: &ExecutionRequest,
        language: &LanguageConfig,
        deadline: Instant,
    ) -> Result<PlagiarismReport, PlagiarismFailure> {
        if request.peer_submissions.is_empty() {
            return Ok(PlagiarismReport::empty(self.plagiarism.threshold));
        }

        let candidate = request.code.clone();
        let peers = request.peer_submissions.clone();
        let style = language.comment_style;
        let config = self.plagiarism;
        let task = tokio::task::spawn_blocking(move || {
            plagiarism::detect(&candidate, &peers, style, &config)
        });

        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => {
                warn!(error = %e, "Plagiarism task failed");
                Err(PlagiarismFailure::Crashed(format!("plagiarism analysis failed: {e}")))
            }
            Err(_) => Err(PlagiarismFailure::DeadlineExceeded),
        }
    }
}

fn error_rank(class: ErrorClass) -> u8 {
    match class {
        ErrorClass::RequestTimeout => 0,
        ErrorClass::SandboxInfrastructureFailure => 1,
        ErrorClass::InternalError => 2,
        ErrorClass::ComparisonError => 3,
        ErrorClass::InputError => 4,
    }
}
