// Local-process backend: a temp work directory and a process group per run.
// Weaker isolation than containers; meant for development and CI hosts.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{compile_script, run_script, OutputCapture, RunJob, RunLimits, RunOutcome, Sandbox};
use crate::error::SandboxError;

/// How often group memory is sampled from /proc
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period for pipe readers after the process group is gone
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// File size ceiling for anything the run writes, in 1 KiB blocks
const FILE_SIZE_BLOCKS: u64 = 64 * 1024;

pub struct ProcessSandbox {
    root: PathBuf,
}

impl ProcessSandbox {
    pub fn new() -> Self {
        Self::with_root(std::env::temp_dir())
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Kills the process group and removes the work directory unless disarmed
struct WorkspaceGuard {
    dir: PathBuf,
    pgid: Option<u32>,
    armed: bool,
}

impl WorkspaceGuard {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            pgid: None,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pgid) = self.pgid {
            kill_process_group(pgid);
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "Failed to remove work directory");
            }
        }
    }
}

enum Exit {
    Status(std::process::ExitStatus),
    TimedOut,
    MemoryExceeded,
}

/// One finished shell step in the work directory
struct Step {
    exit: Exit,
    stdout: OutputCapture,
    stderr: OutputCapture,
    wall_time_ms: u64,
    peak_memory_kb: u64,
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(&self, job: &RunJob) -> Result<RunOutcome, SandboxError> {
        let work_dir = self.root.join(format!("assay-{}", job.run_id.as_simple()));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| SandboxError::Setup(format!("work directory: {e}")))?;
        let mut guard = WorkspaceGuard::new(work_dir.clone());

        tokio::fs::write(work_dir.join(&job.language.source_file), job.source.as_bytes())
            .await
            .map_err(|e| SandboxError::Setup(format!("writing source: {e}")))?;
        let dir = work_dir.to_string_lossy().into_owned();

        if let Some(script) = compile_script(job, &dir) {
            let compile = run_step(
                &script,
                Vec::new(),
                &work_dir,
                job.limits.compile_timeout,
                &job.limits,
                &mut guard,
            )
            .await?;

            if let Some(outcome) = compile_failure(compile, &job.limits) {
                remove_work_dir(&work_dir).await?;
                guard.disarm();
                debug!(run_id = %job.run_id, exit_code = ?outcome.exit_code, "Compile step failed");
                return Ok(outcome);
            }
        }

        let run = run_step(
            &run_script(job, &dir, None),
            job.stdin.clone().into_bytes(),
            &work_dir,
            job.limits.timeout,
            &job.limits,
            &mut guard,
        )
        .await?;

        remove_work_dir(&work_dir).await?;
        guard.disarm();

        let timed_out = matches!(run.exit, Exit::TimedOut);
        let memory_exceeded = matches!(run.exit, Exit::MemoryExceeded);
        let (exit_code, signal) = match &run.exit {
            Exit::Status(status) => (status.code(), exit_signal(status)),
            Exit::TimedOut | Exit::MemoryExceeded => (None, None),
        };

        debug!(
            run_id = %job.run_id,
            exit_code = ?exit_code,
            signal = ?signal,
            wall_time_ms = run.wall_time_ms,
            peak_memory_kb = run.peak_memory_kb,
            timed_out,
            "Process run finished"
        );

        Ok(RunOutcome {
            output_truncated: run.stdout.truncated,
            stderr_truncated: run.stderr.truncated,
            stdout: run.stdout.into_string(),
            stderr: run.stderr.into_string(),
            exit_code,
            signal,
            wall_time_ms: run.wall_time_ms,
            peak_memory_kb: run.peak_memory_kb,
            timed_out,
            memory_exceeded,
            compile_failed: false,
        })
    }
}

/// Run `script` in its own process group until it exits, runs past
/// `budget`, or the group outgrows the memory limit. The whole group is
/// killed before this returns.
async fn run_step(
    script: &str,
    stdin: Vec<u8>,
    work_dir: &Path,
    budget: Duration,
    limits: &RunLimits,
    guard: &mut WorkspaceGuard,
) -> Result<Step, SandboxError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(format!("ulimit -f {FILE_SIZE_BLOCKS}\n{script}"))
        .current_dir(work_dir)
        .env_clear()
        .env("PATH", std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".into()))
        .env("HOME", work_dir)
        .env("LANG", "C.UTF-8")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| SandboxError::Setup(format!("spawning shell: {e}")))?;
    let pid = child
        .id()
        .ok_or_else(|| SandboxError::Infrastructure("child exited before it was tracked".into()))?;
    guard.pgid = Some(pid);

    if let Some(mut pipe) = child.stdin.take() {
        tokio::spawn(async move {
            // A program that never reads stdin closes the pipe early
            let _ = pipe.write_all(&stdin).await;
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Infrastructure("missing stdout pipe".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandboxError::Infrastructure("missing stderr pipe".into()))?;
    let stdout_task = tokio::spawn(read_limited(stdout, limits.max_output_bytes));
    let stderr_task = tokio::spawn(read_limited(stderr, limits.max_output_bytes));

    let deadline = started + budget;
    let memory_limit_kb = limits.memory_limit_kb();
    let mut peak_memory_kb = 0u64;
    let mut ticker = tokio::time::interval(MEMORY_SAMPLE_INTERVAL);

    let exit = loop {
        tokio::select! {
            status = child.wait() => {
                break Exit::Status(status.map_err(|e| {
                    SandboxError::Infrastructure(format!("waiting for child: {e}"))
                })?);
            }
            _ = tokio::time::sleep_until(deadline) => break Exit::TimedOut,
            _ = ticker.tick() => {
                let sample = tokio::task::spawn_blocking(move || group_memory_kb(pid))
                    .await
                    .ok()
                    .flatten();
                if let Some(kb) = sample {
                    peak_memory_kb = peak_memory_kb.max(kb);
                    if peak_memory_kb > memory_limit_kb {
                        break Exit::MemoryExceeded;
                    }
                }
            }
        }
    };

    // Background children outlive the shell; the group goes down either way
    kill_process_group(pid);
    if !matches!(exit, Exit::Status(_)) {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
    guard.pgid = None;
    let wall_time_ms = started.elapsed().as_millis() as u64;

    Ok(Step {
        exit,
        stdout: drain(stdout_task).await,
        stderr: drain(stderr_task).await,
        wall_time_ms,
        peak_memory_kb,
    })
}

/// Outcome to report when the compile step did not succeed
fn compile_failure(step: Step, limits: &RunLimits) -> Option<RunOutcome> {
    let (note, exit_code) = match step.exit {
        Exit::Status(status) if status.success() => return None,
        Exit::Status(status) => (None, status.code()),
        Exit::TimedOut => (
            Some(format!(
                "compilation exceeded {} ms",
                limits.compile_timeout.as_millis()
            )),
            None,
        ),
        Exit::MemoryExceeded => (
            Some(format!(
                "compilation exceeded {} MB of memory",
                limits.memory_limit_mb
            )),
            None,
        ),
    };

    let mut diagnostics = step.stdout.into_string();
    diagnostics.push_str(&step.stderr.into_string());
    if let Some(note) = note {
        if !diagnostics.is_empty() && !diagnostics.ends_with('\n') {
            diagnostics.push('\n');
        }
        diagnostics.push_str(&note);
    }
    Some(RunOutcome::compile_failure(diagnostics, exit_code))
}

async fn read_limited<R>(mut reader: R, limit: usize) -> OutputCapture
where
    R: AsyncRead + Unpin,
{
    let mut capture = OutputCapture::new(limit);
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            // Keep draining past the limit so the writer never blocks on a full pipe
            Ok(n) => {
                capture.push(&chunk[..n]);
            }
            Err(_) => break,
        }
    }
    capture
}

async fn drain(task: tokio::task::JoinHandle<OutputCapture>) -> OutputCapture {
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(capture)) => capture,
        Ok(Err(_)) => OutputCapture::new(0),
        Err(_) => {
            abort.abort();
            OutputCapture::new(0)
        }
    }
}

async fn remove_work_dir(dir: &Path) -> Result<(), SandboxError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SandboxError::Teardown(format!("{}: {e}", dir.display()))),
    }
}

/// Resident memory of process group `pgid` in KiB: the summed VmRSS of
/// every member, or the leader's VmHWM when that is higher.
/// None once no member is left.
fn group_memory_kb(pgid: u32) -> Option<u64> {
    let entries = std::fs::read_dir("/proc").ok()?;
    let mut members = 0usize;
    let mut resident_kb = 0u64;
    let mut leader_hwm_kb = 0u64;

    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // Members exit between the listing and the read; skip them
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if parse_stat_pgrp(&stat) != Some(pgid) {
            continue;
        }
        let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
            continue;
        };
        members += 1;
        resident_kb += parse_status_kb(&status, "VmRSS:").unwrap_or(0);
        if pid == pgid {
            leader_hwm_kb = parse_status_kb(&status, "VmHWM:").unwrap_or(0);
        }
    }

    (members > 0).then_some(resident_kb.max(leader_hwm_kb))
}

/// Process group id from a /proc/<pid>/stat line. The command name may
/// itself contain spaces and parentheses, so fields are counted from the
/// last `)`.
fn parse_stat_pgrp(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // state, ppid, pgrp
    rest.split_whitespace().nth(2)?.parse().ok()
}

fn parse_status_kb(status: &str, field: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // Pid 0 would address our own group
    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    if raw <= 0 {
        return;
    }
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
