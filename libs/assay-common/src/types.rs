use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Weight assigned to a test case when the caller omits it
pub const DEFAULT_WEIGHT: u32 = 1;

fn default_weight() -> u32 {
    DEFAULT_WEIGHT
}

/// Grading job submitted by the calling backend
///
/// Unknown fields are rejected so a misspelled category never silently
/// grades against nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub test_cases_basic: Vec<TestCase>,
    #[serde(default)]
    pub test_cases_advanced: Vec<TestCase>,
    #[serde(default)]
    pub test_cases_custom: Vec<TestCase>,
    #[serde(default)]
    pub peer_submissions: Vec<PeerSubmission>,
    /// Per-run timeout override in seconds; the language default applies when absent
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl ExecutionRequest {
    pub fn total_test_cases(&self) -> usize {
        self.test_cases_basic.len() + self.test_cases_advanced.len() + self.test_cases_custom.len()
    }

    /// Test cases of one category, in submission order
    pub fn cases(&self, category: TestCategory) -> &[TestCase] {
        match category {
            TestCategory::Basic => &self.test_cases_basic,
            TestCategory::Advanced => &self.test_cases_advanced,
            TestCategory::Custom => &self.test_cases_custom,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestCase {
    #[serde(default)]
    pub input: String,
    pub expected_output: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerSubmission {
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub submission_id: String,
    pub code: String,
}

/// Backend identifiers arrive either as database integers or as strings
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCategory {
    Basic,
    Advanced,
    Custom,
}

impl TestCategory {
    pub const ALL: [TestCategory; 3] = [
        TestCategory::Basic,
        TestCategory::Advanced,
        TestCategory::Custom,
    ];
}

impl fmt::Display for TestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestCategory::Basic => write!(f, "basic"),
            TestCategory::Advanced => write!(f, "advanced"),
            TestCategory::Custom => write!(f, "custom"),
        }
    }
}

/// Outcome of a single graded test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    WrongAnswer,
    RuntimeError,
    CompilationError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    InternalError,
    Cancelled,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TestStatus::Passed => "passed",
            TestStatus::WrongAnswer => "wrong_answer",
            TestStatus::RuntimeError => "runtime_error",
            TestStatus::CompilationError => "compilation_error",
            TestStatus::TimeLimitExceeded => "time_limit_exceeded",
            TestStatus::MemoryLimitExceeded => "memory_limit_exceeded",
            TestStatus::OutputLimitExceeded => "output_limit_exceeded",
            TestStatus::InternalError => "internal_error",
            TestStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub index: usize,
    pub weight: u32,
    pub status: TestStatus,
    pub passed: bool,
    pub expected_output: String,
    pub actual_output: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub runtime_ms: u64,
    pub memory_kb: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Slowest single run, not the sum
    pub runtime_ms: u64,
    /// Largest single-run peak, not the sum
    pub peak_memory_kb: u64,
    pub passed_test_cases: usize,
    pub total_test_cases: usize,
    pub score_percent: f64,
    /// Total weight was zero, so the score carries no information
    #[serde(default)]
    pub degenerate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlagiarismMatch {
    pub peer_id: String,
    pub user_id: String,
    pub similarity: f64,
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonFailure {
    pub peer_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlagiarismReport {
    pub flagged: bool,
    pub max_similarity: f64,
    pub threshold: f64,
    pub matches: Vec<PlagiarismMatch>,
    #[serde(default)]
    pub failures: Vec<ComparisonFailure>,
}

impl PlagiarismReport {
    /// Report for a request without peers
    pub fn empty(threshold: f64) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    Partial,
    Failed,
    Rejected,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStatus::Completed => write!(f, "completed"),
            ResponseStatus::Partial => write!(f, "partial"),
            ResponseStatus::Failed => write!(f, "failed"),
            ResponseStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Machine-readable prefix of the response `error` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    InputError,
    SandboxInfrastructureFailure,
    RequestTimeout,
    ComparisonError,
    InternalError,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::InputError => "input_error",
            ErrorClass::SandboxInfrastructureFailure => "sandbox_infrastructure_failure",
            ErrorClass::RequestTimeout => "request_timeout",
            ErrorClass::ComparisonError => "comparison_error",
            ErrorClass::InternalError => "internal_error",
        }
    }

    /// Render the `error` field value, e.g. `input_error: no test cases supplied`
    pub fn with_message(&self, message: impl fmt::Display) -> String {
        format!("{}: {}", self.as_str(), message)
    }

    /// Recover the class from a rendered `error` field
    pub fn from_error_field(field: &str) -> Option<Self> {
        let (class, _) = field.split_once(':')?;
        [
            ErrorClass::InputError,
            ErrorClass::SandboxInfrastructureFailure,
            ErrorClass::RequestTimeout,
            ErrorClass::ComparisonError,
            ErrorClass::InternalError,
        ]
        .into_iter()
        .find(|c| c.as_str() == class)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeExecutionResponse {
    pub request_id: Uuid,
    pub status: ResponseStatus,
    pub language: String,
    pub test_cases_basic: Vec<TestCaseResult>,
    pub test_cases_advanced: Vec<TestCaseResult>,
    pub test_cases_custom: Vec<TestCaseResult>,
    pub execution_summary: ExecutionSummary,
    pub plagiarism_report: PlagiarismReport,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl CodeExecutionResponse {
    /// Response for a request refused at validation; no sandbox was touched
    pub fn rejected(language: &str, message: impl fmt::Display) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            status: ResponseStatus::Rejected,
            language: language.to_string(),
            test_cases_basic: Vec::new(),
            test_cases_advanced: Vec::new(),
            test_cases_custom: Vec::new(),
            execution_summary: ExecutionSummary::default(),
            plagiarism_report: PlagiarismReport::default(),
            error: Some(ErrorClass::InputError.with_message(message)),
            completed_at: Utc::now(),
        }
    }

    pub fn results(&self, category: TestCategory) -> &[TestCaseResult] {
        match category {
            TestCategory::Basic => &self.test_cases_basic,
            TestCategory::Advanced => &self.test_cases_advanced,
            TestCategory::Custom => &self.test_cases_custom,
        }
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_deref().and_then(ErrorClass::from_error_field)
    }
}

/// One entry of the language discovery endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub name: String,
    pub version: String,
    pub extension: String,
    pub timeout_ms: u64,
    pub memory_limit_mb: u32,
    pub starter_template: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let raw = r#"{
            "code": "print(1+1)",
            "language": "python",
            "test_cases_basic": [{"expected_output": "2"}]
        }"#;
        let request: ExecutionRequest = serde_json::from_str(raw).unwrap();

        assert_eq!(request.test_cases_basic[0].weight, DEFAULT_WEIGHT);
        assert_eq!(request.test_cases_basic[0].input, "");
        assert!(request.test_cases_advanced.is_empty());
        assert!(request.peer_submissions.is_empty());
        assert_eq!(request.timeout, None);
        assert_eq!(request.total_test_cases(), 1);
    }

    #[test]
    fn test_request_rejects_unknown_fields() {
        let raw = r#"{"code": "x", "language": "python", "test_cases_extra": []}"#;
        assert!(serde_json::from_str::<ExecutionRequest>(raw).is_err());
    }

    #[test]
    fn test_peer_ids_accept_numbers() {
        let raw = r#"{"user_id": 42, "submission_id": "s-7", "code": "x = 1"}"#;
        let peer: PeerSubmission = serde_json::from_str(raw).unwrap();
        assert_eq!(peer.user_id, "42");
        assert_eq!(peer.submission_id, "s-7");
    }

    #[test]
    fn test_error_class_round_trip_through_field() {
        let field = ErrorClass::RequestTimeout.with_message("deadline of 100ms exceeded");
        assert_eq!(field, "request_timeout: deadline of 100ms exceeded");
        assert_eq!(
            ErrorClass::from_error_field(&field),
            Some(ErrorClass::RequestTimeout)
        );
        assert_eq!(ErrorClass::from_error_field("something else"), None);
    }

    #[test]
    fn test_rejected_response_shape() {
        let response = CodeExecutionResponse::rejected("cobol", "unsupported language 'cobol'");
        assert_eq!(response.status, ResponseStatus::Rejected);
        assert_eq!(response.error_class(), Some(ErrorClass::InputError));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "rejected");
        assert!(json["test_cases_basic"].as_array().unwrap().is_empty());
        assert_eq!(json["plagiarism_report"]["flagged"], false);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&TestStatus::TimeLimitExceeded).unwrap(),
            "\"time_limit_exceeded\""
        );
        assert_eq!(TestStatus::WrongAnswer.to_string(), "wrong_answer");
    }
}
