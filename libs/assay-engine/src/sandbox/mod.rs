//! Sandboxed Runner - isolated execution of untrusted code
//!
//! A backend takes one `RunJob` (source, language recipe, stdin, limits),
//! runs the language's compile and run steps inside a fresh disposable
//! context, and reports raw stdout/stderr/exit status/resource usage.
//!
//! The compile step runs first under its own budget (`compile_timeout`).
//! Only the run step is timed against `timeout` and reported in
//! `wall_time_ms`, so a slow compiler never turns into a run timeout.
//!
//! Backends do not judge output. Timeouts and limit breaches are reported
//! as flags on `RunOutcome`; only failures of the context itself surface as
//! `SandboxError`. Every backend tears its context down before `run`
//! returns, and again from a drop guard when the caller cancels.

mod docker;
mod process;

use crate::error::SandboxError;
use crate::registry::LanguageConfig;
use anyhow::Context;
use assay_common::config::{EngineSettings, SandboxBackendKind};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use docker::DockerSandbox;
pub use process::ProcessSandbox;

#[derive(Debug, Clone, PartialEq)]
pub struct RunLimits {
    /// Wall-clock budget of the run step alone
    pub timeout: Duration,
    /// Wall-clock budget of the compile step, when the language has one
    pub compile_timeout: Duration,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub max_output_bytes: usize,
    pub pids_limit: i64,
}

impl RunLimits {
    /// Effective limits for one language; the timeout override is in seconds
    /// and never lifts the result above `max_timeout_ms`
    pub fn resolve(
        language: &LanguageConfig,
        settings: &EngineSettings,
        timeout_override_secs: Option<u64>,
    ) -> Self {
        let requested_ms = timeout_override_secs
            .map(|secs| secs.saturating_mul(1000))
            .unwrap_or(language.timeout_ms);
        let timeout_ms = requested_ms.clamp(1, settings.max_timeout_ms);

        Self {
            timeout: Duration::from_millis(timeout_ms),
            compile_timeout: Duration::from_millis(settings.compile_timeout_ms),
            memory_limit_mb: language.memory_limit_mb,
            cpu_limit: language.cpu_limit,
            max_output_bytes: settings.max_output_bytes,
            pids_limit: settings.pids_limit,
        }
    }

    /// Whole seconds of CPU time granted to the run step, one above its wall-clock budget
    pub fn cpu_seconds(&self) -> u64 {
        cpu_seconds_for(self.timeout)
    }

    pub fn compile_cpu_seconds(&self) -> u64 {
        cpu_seconds_for(self.compile_timeout)
    }

    pub fn memory_limit_kb(&self) -> u64 {
        u64::from(self.memory_limit_mb) * 1024
    }
}

fn cpu_seconds_for(budget: Duration) -> u64 {
    (budget.as_millis() as u64).div_ceil(1000) + 1
}

#[derive(Debug, Clone)]
pub struct RunJob {
    pub run_id: Uuid,
    pub language: Arc<LanguageConfig>,
    pub source: Arc<str>,
    pub stdin: String,
    pub limits: RunLimits,
}

impl RunJob {
    pub fn new(
        language: Arc<LanguageConfig>,
        source: Arc<str>,
        stdin: impl Into<String>,
        limits: RunLimits,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            language,
            source,
            stdin: stdin.into(),
            limits,
        }
    }
}

/// Raw result of one sandboxed execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    /// None when the run timed out or was killed by a signal
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Run step only; compile time is not counted
    pub wall_time_ms: u64,
    pub peak_memory_kb: u64,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    /// Stdout hit `max_output_bytes`
    pub output_truncated: bool,
    /// Stderr hit `max_output_bytes`; it is capped but never judged
    pub stderr_truncated: bool,
    /// The compile step exited non-zero or ran out of budget; `stderr` holds
    /// its diagnostics and nothing was run
    pub compile_failed: bool,
}

impl RunOutcome {
    fn compile_failure(diagnostics: String, exit_code: Option<i32>) -> Self {
        Self {
            stderr: diagnostics,
            exit_code,
            compile_failed: true,
            ..Default::default()
        }
    }

    /// Terminated on its own with status 0
    pub fn exited_cleanly(&self) -> bool {
        !self.timed_out && self.signal.is_none() && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, job: &RunJob) -> Result<RunOutcome, SandboxError>;
}

pub struct SandboxFactory;

impl SandboxFactory {
    pub fn from_settings(settings: &EngineSettings) -> anyhow::Result<Arc<dyn Sandbox>> {
        match settings.sandbox_backend {
            SandboxBackendKind::Docker => Ok(Arc::new(
                DockerSandbox::new().context("docker sandbox backend init failed")?,
            )),
            SandboxBackendKind::Process => Ok(Arc::new(ProcessSandbox::new())),
        }
    }
}

/// Shell script for the compile step, if the language has one.
/// Compiler stdout and stderr are merged; stdin is closed.
fn compile_script(job: &RunJob, work_dir: &str) -> Option<String> {
    let compile = job.language.compile_command()?;
    Some(format!(
        "ulimit -t {}\ncd '{work_dir}' || exit 1\n{{ {compile}\n}} < /dev/null 2>&1\n",
        job.limits.compile_cpu_seconds()
    ))
}

/// Shell script for the run step; `stdin_file` is read instead of the
/// inherited stdin when given
fn run_script(job: &RunJob, work_dir: &str, stdin_file: Option<&str>) -> String {
    let mut script = format!(
        "ulimit -t {}\ncd '{work_dir}' || exit 1\nexec {}",
        job.limits.cpu_seconds(),
        job.language.run_command()
    );
    if let Some(path) = stdin_file {
        script.push_str(&format!(" < '{path}'"));
    }
    script.push('\n');
    script
}

/// Byte sink that stops growing at `limit` and remembers that it did
#[derive(Debug)]
struct OutputCapture {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputCapture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(8192)),
            limit,
            truncated: false,
        }
    }

    /// Returns false once the limit has been crossed
    fn push(&mut self, chunk: &[u8]) -> bool {
        let remaining = self.limit.saturating_sub(self.buf.len());
        if chunk.len() > remaining {
            self.buf.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
            return false;
        }
        self.buf.extend_from_slice(chunk);
        true
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LanguageRegistry;

    fn job(language: &str, timeout_ms: u64) -> RunJob {
        let language = LanguageRegistry::builtin().lookup(language).unwrap();
        let settings = EngineSettings::default();
        let mut limits = RunLimits::resolve(&language, &settings, None);
        limits.timeout = Duration::from_millis(timeout_ms);
        RunJob::new(language, Arc::from("print(1)"), "", limits)
    }

    #[test]
    fn test_timeout_override_is_capped() {
        let language = LanguageRegistry::builtin().lookup("python").unwrap();
        let settings = EngineSettings::default();

        let default = RunLimits::resolve(&language, &settings, None);
        assert_eq!(default.timeout, Duration::from_millis(10_000));

        let overridden = RunLimits::resolve(&language, &settings, Some(2));
        assert_eq!(overridden.timeout, Duration::from_secs(2));

        let capped = RunLimits::resolve(&language, &settings, Some(3600));
        assert_eq!(capped.timeout, Duration::from_millis(settings.max_timeout_ms));

        let huge = RunLimits::resolve(&language, &settings, Some(u64::MAX));
        assert_eq!(huge.timeout, Duration::from_millis(settings.max_timeout_ms));
    }

    #[test]
    fn test_cpu_seconds_rounds_up() {
        assert_eq!(job("python", 1).limits.cpu_seconds(), 2);
        assert_eq!(job("python", 1000).limits.cpu_seconds(), 2);
        assert_eq!(job("python", 1500).limits.cpu_seconds(), 3);
    }

    #[test]
    fn test_compile_budget_is_separate_from_run_timeout() {
        let java = job("java", 1000);
        assert_eq!(java.limits.cpu_seconds(), 2);
        assert_eq!(
            java.limits.compile_timeout,
            Duration::from_millis(EngineSettings::default().compile_timeout_ms)
        );
        assert_eq!(java.limits.compile_cpu_seconds(), 31);
    }

    #[test]
    fn test_script_for_interpreted_language() {
        let run = job("python", 1000);
        assert!(compile_script(&run, "/work").is_none());

        let script = run_script(&run, "/work", None);
        assert!(script.starts_with("ulimit -t 2\n"));
        assert!(script.contains("cd '/work'"));
        assert!(script.ends_with("exec python3 -u main.py\n"));
    }

    #[test]
    fn test_scripts_for_compiled_language() {
        let run = job("java", 1000);
        let compile = compile_script(&run, "/tmp/assay").unwrap();
        assert!(compile.starts_with("ulimit -t 31\n"));
        assert!(compile.contains("{ javac Main.java\n} < /dev/null 2>&1"));

        let script = run_script(&run, "/tmp/assay", Some(".assay-stdin"));
        assert!(script.starts_with("ulimit -t 2\n"));
        assert!(!script.contains("javac"));
        assert!(script.ends_with("exec java -Xss64m -cp . Main < '.assay-stdin'\n"));
    }

    #[test]
    fn test_capture_truncates_at_limit() {
        let mut capture = OutputCapture::new(5);
        assert!(capture.push(b"abc"));
        assert!(!capture.push(b"defg"));
        assert!(capture.truncated);
        assert_eq!(capture.into_string(), "abcde");
    }

    #[test]
    fn test_capture_exact_limit_is_not_truncated() {
        let mut capture = OutputCapture::new(3);
        assert!(capture.push(b"abc"));
        assert!(!capture.truncated);
    }

    #[test]
    fn test_clean_exit() {
        let ok = RunOutcome {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.exited_cleanly());

        let timed_out = RunOutcome {
            timed_out: true,
            ..Default::default()
        };
        assert!(!timed_out.exited_cleanly());

        let crashed = RunOutcome {
            exit_code: Some(1),
            ..Default::default()
        };
        assert!(!crashed.exited_cleanly());
    }
}
