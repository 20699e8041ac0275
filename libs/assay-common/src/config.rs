// Engine settings, read once from the environment at process start

use std::{env, fmt, net::SocketAddr, path::PathBuf, str::FromStr};
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxBackendKind {
    #[default]
    Docker,
    Process,
}

impl FromStr for SandboxBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "process" => Ok(Self::Process),
            _ => Err(format!("unsupported sandbox backend: {s}")),
        }
    }
}

impl fmt::Display for SandboxBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Process => write!(f, "process"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unsupported log format: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub bind_addr: SocketAddr,
    pub languages_path: PathBuf,
    pub sandbox_backend: SandboxBackendKind,
    /// Admission gate capacity: concurrent sandboxed runs across all requests
    pub max_concurrent_runs: usize,
    /// Runs one request may have in flight at once
    pub max_parallel_cases: usize,
    /// Hard ceiling on any per-run timeout, overrides included
    pub max_timeout_ms: u64,
    /// Budget for a language's compile step, separate from the run timeout
    pub compile_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub request_deadline_ms: u64,
    pub pids_limit: i64,
    pub plagiarism_threshold: f64,
    /// Pairs at or above this similarity are listed even when not flagged
    pub plagiarism_report_floor: f64,
    pub plagiarism_kgram: usize,
    pub log_format: LogFormat,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            languages_path: PathBuf::from("config/languages.json"),
            sandbox_backend: SandboxBackendKind::Docker,
            max_concurrent_runs: 8,
            max_parallel_cases: 4,
            max_timeout_ms: 30_000,
            compile_timeout_ms: 30_000,
            max_output_bytes: 64 * 1024,
            max_source_bytes: 64 * 1024,
            max_stdin_bytes: 64 * 1024,
            request_deadline_ms: 120_000,
            pids_limit: 64,
            plagiarism_threshold: 0.8,
            plagiarism_report_floor: 0.5,
            plagiarism_kgram: 5,
            log_format: LogFormat::Text,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_parse("BIND_ADDR", d.bind_addr),
            languages_path: env::var("LANGUAGES_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.languages_path),
            sandbox_backend: env_parse("SANDBOX_BACKEND", d.sandbox_backend),
            max_concurrent_runs: env_parse("MAX_CONCURRENT_RUNS", d.max_concurrent_runs),
            max_parallel_cases: env_parse("MAX_PARALLEL_CASES", d.max_parallel_cases),
            max_timeout_ms: env_parse("MAX_TIMEOUT_MS", d.max_timeout_ms),
            compile_timeout_ms: env_parse("COMPILE_TIMEOUT_MS", d.compile_timeout_ms),
            max_output_bytes: env_parse("MAX_OUTPUT_BYTES", d.max_output_bytes),
            max_source_bytes: env_parse("MAX_SOURCE_BYTES", d.max_source_bytes),
            max_stdin_bytes: env_parse("MAX_STDIN_BYTES", d.max_stdin_bytes),
            request_deadline_ms: env_parse("REQUEST_DEADLINE_MS", d.request_deadline_ms),
            pids_limit: env_parse("PIDS_LIMIT", d.pids_limit),
            plagiarism_threshold: env_parse("PLAGIARISM_THRESHOLD", d.plagiarism_threshold),
            plagiarism_report_floor: env_parse("PLAGIARISM_REPORT_FLOOR", d.plagiarism_report_floor),
            plagiarism_kgram: env_parse("PLAGIARISM_KGRAM", d.plagiarism_kgram),
            log_format: env_parse("LOG_FORMAT", d.log_format),
        }
        .normalized()
    }

    /// Clamp every knob into a range the engine can operate safely in
    pub fn normalized(mut self) -> Self {
        self.max_concurrent_runs = self.max_concurrent_runs.clamp(1, 256);
        self.max_parallel_cases = self.max_parallel_cases.clamp(1, self.max_concurrent_runs);
        self.max_timeout_ms = self.max_timeout_ms.clamp(100, 300_000);
        self.compile_timeout_ms = self.compile_timeout_ms.clamp(1_000, 300_000);
        self.max_output_bytes = self.max_output_bytes.clamp(1024, 16 * 1024 * 1024);
        self.max_source_bytes = self.max_source_bytes.clamp(1024, 1024 * 1024);
        self.max_stdin_bytes = self.max_stdin_bytes.clamp(1024, 16 * 1024 * 1024);
        self.request_deadline_ms = self
            .request_deadline_ms
            .max(self.max_timeout_ms + self.compile_timeout_ms);
        self.pids_limit = self.pids_limit.clamp(8, 4096);
        self.plagiarism_threshold = clamp_unit(self.plagiarism_threshold);
        self.plagiarism_report_floor =
            clamp_unit(self.plagiarism_report_floor).min(self.plagiarism_threshold);
        self.plagiarism_kgram = self.plagiarism_kgram.clamp(1, 32);
        self
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + fmt::Debug,
{
    parse_or_default(key, env::var(key).ok(), default)
}

/// Parse a raw setting, keeping `default` (with a warning) when it is malformed
fn parse_or_default<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + fmt::Debug,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, default = ?default, "Ignoring malformed environment value");
            default
        }
    }
}
