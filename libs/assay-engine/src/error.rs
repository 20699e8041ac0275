use thiserror::Error;

/// Caller-side problems; rejected before any sandbox is touched
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),
    #[error("no test cases supplied")]
    NoTestCases,
    #[error("source code is empty")]
    EmptySource,
    #[error("source code exceeds {limit} bytes")]
    SourceTooLarge { limit: usize },
    #[error("{category} test case {index}: input exceeds {limit} bytes")]
    InputTooLarge {
        category: String,
        index: usize,
        limit: usize,
    },
    #[error("{category} test case {index}: weight must be at least 1")]
    ZeroWeight { category: String, index: usize },
    #[error("duplicate peer submission id '{0}'")]
    DuplicatePeer(String),
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),
    #[error("duplicate language identifier '{0}'")]
    DuplicateLanguage(String),
    #[error("language '{name}': {reason}")]
    InvalidLanguage { name: String, reason: String },
    #[error("no languages configured")]
    Empty,
}

impl From<RegistryError> for InputError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::UnsupportedLanguage(name) => InputError::UnsupportedLanguage(name),
            other => InputError::UnsupportedLanguage(other.to_string()),
        }
    }
}

/// Failures of the execution context itself
///
/// Timeouts and limit breaches are not errors here: they come back as flags
/// on `RunOutcome` and fail only the test case that hit them.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("execution context could not be created: {0}")]
    Setup(String),
    #[error("execution context failed: {0}")]
    Infrastructure(String),
    #[error("execution context could not be torn down: {0}")]
    Teardown(String),
    #[error("no sandbox slot became free before the request deadline")]
    AdmissionTimeout,
}

impl From<std::io::Error> for SandboxError {
    fn from(value: std::io::Error) -> Self {
        Self::Infrastructure(value.to_string())
    }
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(value: bollard::errors::Error) -> Self {
        Self::Infrastructure(value.to_string())
    }
}
