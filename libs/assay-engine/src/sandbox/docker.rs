// Container backend: one fresh container per run, removed before `run` returns.
//
// The container only sleeps; setup, compile and run are separate execs in it.
// Source and stdin travel base64-encoded in the setup exec's environment and
// are decoded into a tmpfs work directory. The root filesystem is read-only,
// networking is off, all capabilities are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StatsOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{compile_script, run_script, OutputCapture, RunJob, RunOutcome, Sandbox};
use crate::error::SandboxError;

const WORK_DIR: &str = "/tmp/assay";
const STDIN_FILE: &str = ".assay-stdin";
const NOBODY: &str = "65534:65534";
const TMPFS_OPTIONS: &str = "rw,exec,nosuid,size=64m";

/// Keep-alive slack on top of the compile and run budgets
const KEEP_ALIVE_SLACK: Duration = Duration::from_secs(10);

/// Exit status of a process killed with SIGKILL, as Docker reports it
const SIGKILL_EXIT_CODE: i64 = 128 + 9;

/// Container cleanup guard - force-removes the container on drop unless disarmed
///
/// Covers panics and callers dropping the `run` future mid-flight.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: &Docker, container_id: String) -> Self {
        Self {
            docker: docker.clone(),
            container_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);
        // Drop cannot await; outside a runtime there is nothing to schedule on
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %container_id, "No runtime available to remove container");
            return;
        };
        handle.spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

pub struct DockerSandbox {
    docker: Docker,
}

impl DockerSandbox {
    pub fn new() -> anyhow::Result<Self> {
        use anyhow::Context;
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Image cache check; pulls synchronously on a miss
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Setup(format!("pulling image '{image}': {e}")))?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    fn container_config(&self, job: &RunJob) -> Config<String> {
        let keep_alive = job.limits.compile_timeout + job.limits.timeout + KEEP_ALIVE_SLACK;

        let memory_bytes = i64::from(job.limits.memory_limit_mb) * 1024 * 1024;
        let nano_cpus = (f64::from(job.limits.cpu_limit) * 1_000_000_000.0) as i64;
        let tmpfs = HashMap::from([("/tmp".to_string(), TMPFS_OPTIONS.to_string())]);

        Config {
            image: Some(job.language.image.clone()),
            entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            cmd: Some(vec![format!("sleep {}", keep_alive.as_secs())]),
            env: Some(vec!["HOME=/tmp".to_string()]),
            user: Some(NOBODY.to_string()),
            working_dir: Some("/tmp".to_string()),
            network_disabled: Some(true),
            labels: Some(HashMap::from([(
                "assay.run_id".to_string(),
                job.run_id.to_string(),
            )])),
            host_config: Some(HostConfig {
                memory: Some(memory_bytes),
                memory_swap: Some(memory_bytes),
                nano_cpus: Some(nano_cpus),
                pids_limit: Some(job.limits.pids_limit),
                network_mode: Some("none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                init: Some(true),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Peak memory sampler; runs until the stats stream ends or is aborted
    fn spawn_memory_sampler(
        &self,
        container_id: &str,
        peak_bytes: Arc<AtomicU64>,
    ) -> tokio::task::JoinHandle<()> {
        let docker = self.docker.clone();
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            let options = Some(StatsOptions {
                stream: true,
                one_shot: false,
            });
            let mut stats = docker.stats(&container_id, options);
            while let Some(Ok(sample)) = stats.next().await {
                let memory = &sample.memory_stats;
                if let Some(bytes) = memory.max_usage.or(memory.usage) {
                    peak_bytes.fetch_max(bytes, Ordering::Relaxed);
                }
            }
        })
    }

    /// Writes source and stdin into the work directory
    async fn setup(&self, container_id: &str, job: &RunJob) -> Result<(), SandboxError> {
        let script = format!(
            "mkdir -p '{WORK_DIR}' && cd '{WORK_DIR}' || exit 1\n\
             printf '%s' \"$ASSAY_SOURCE\" | base64 -d > '{}' || exit 1\n\
             printf '%s' \"$ASSAY_STDIN\" | base64 -d > {STDIN_FILE} || exit 1\n",
            job.language.source_file
        );
        let env = vec![
            format!(
                "ASSAY_SOURCE={}",
                general_purpose::STANDARD.encode(job.source.as_bytes())
            ),
            format!(
                "ASSAY_STDIN={}",
                general_purpose::STANDARD.encode(job.stdin.as_bytes())
            ),
        ];

        let setup = self.exec(container_id, script, env, 4096).await?;
        if setup.exit_code != Some(0) {
            return Err(SandboxError::Setup(format!(
                "writing source: {}",
                setup.stderr.into_string().trim()
            )));
        }
        Ok(())
    }

    /// Run `script` as an exec in the container and collect its output
    async fn exec(
        &self,
        container_id: &str,
        script: String,
        env: Vec<String>,
        output_limit: usize,
    ) -> Result<ExecOutput, SandboxError> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
            env: Some(env),
            working_dir: Some("/tmp".to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| SandboxError::Infrastructure(format!("creating exec: {e}")))?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };
        let mut stdout = OutputCapture::new(output_limit);
        let mut stderr = OutputCapture::new(output_limit);

        match self.docker.start_exec(&exec.id, Some(start_config)).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(frame) = output.next().await {
                    match frame {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push(&message);
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push(&message);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(SandboxError::Infrastructure(format!(
                                "reading exec output: {e}"
                            )))
                        }
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(SandboxError::Infrastructure(
                    "exec started detached".to_string(),
                ))
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code,
        })
    }

    async fn kill(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(error = %e, "Failed to kill container");
        }
    }

    async fn remove(&self, container_id: &str, guard: &mut ContainerGuard) -> Result<(), SandboxError> {
        let remove_options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(remove_options))
            .await
            .map_err(|e| SandboxError::Teardown(format!("{container_id}: {e}")))?;
        guard.disarm();
        Ok(())
    }

    /// Runs the compile exec; `Some` carries the outcome to report when it failed
    async fn compile(
        &self,
        container_id: &str,
        job: &RunJob,
    ) -> Result<Option<RunOutcome>, SandboxError> {
        let Some(script) = compile_script(job, WORK_DIR) else {
            return Ok(None);
        };

        let started = Instant::now();
        let budget = job.limits.compile_timeout;
        let compiled = tokio::time::timeout(
            budget,
            self.exec(container_id, script, Vec::new(), job.limits.max_output_bytes),
        )
        .await;
        let compile_time_ms = started.elapsed().as_millis() as u64;

        match compiled {
            Ok(output) => {
                let output = output?;
                if output.exit_code == Some(0) {
                    debug!(compile_time_ms, "Compilation succeeded");
                    return Ok(None);
                }
                debug!(compile_time_ms, exit_code = ?output.exit_code, "Compilation failed");
                let mut diagnostics = output.stdout.into_string();
                diagnostics.push_str(&output.stderr.into_string());
                Ok(Some(RunOutcome::compile_failure(
                    diagnostics,
                    output.exit_code.map(|code| code as i32),
                )))
            }
            Err(_) => {
                debug!(compile_time_ms, "Compilation ran out of budget");
                Ok(Some(RunOutcome::compile_failure(
                    format!("compilation exceeded {} ms", budget.as_millis()),
                    None,
                )))
            }
        }
    }
}

struct ExecOutput {
    stdout: OutputCapture,
    stderr: OutputCapture,
    exit_code: Option<i64>,
}

/// A SIGKILL near the memory ceiling is the kernel OOM killer even when the
/// container's own `OOMKilled` flag stays unset
fn killed_for_memory(oom_killed: bool, exit_code: Option<i64>, peak_kb: u64, limit_kb: u64) -> bool {
    oom_killed || (exit_code == Some(SIGKILL_EXIT_CODE) && peak_kb * 100 >= limit_kb * 95)
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[tracing::instrument(skip(self, job), fields(run_id = %job.run_id, language = %job.language.name))]
    async fn run(&self, job: &RunJob) -> Result<RunOutcome, SandboxError> {
        self.ensure_image(&job.language.image).await?;

        let create_options = CreateContainerOptions {
            name: format!("assay-{}", job.run_id.as_simple()),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), self.container_config(job))
            .await
            .map_err(|e| SandboxError::Setup(format!("creating container: {e}")))?;
        let container_id = container.id;

        // Armed immediately so cancellation from here on still removes the container
        let mut guard = ContainerGuard::new(&self.docker, container_id.clone());

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Setup(format!("starting container: {e}")))?;

        self.setup(&container_id, job).await?;
        if let Some(outcome) = self.compile(&container_id, job).await? {
            self.remove(&container_id, &mut guard).await?;
            return Ok(outcome);
        }

        let peak_bytes = Arc::new(AtomicU64::new(0));
        let sampler = self.spawn_memory_sampler(&container_id, peak_bytes.clone());

        let started = Instant::now();
        let ran = tokio::time::timeout(
            job.limits.timeout,
            self.exec(
                &container_id,
                run_script(job, WORK_DIR, Some(STDIN_FILE)),
                Vec::new(),
                job.limits.max_output_bytes,
            ),
        )
        .await;
        let wall_time_ms = started.elapsed().as_millis() as u64;

        let output = match ran {
            Ok(output) => Some(output?),
            Err(_) => {
                debug!(timeout_ms = job.limits.timeout.as_millis() as u64, "Run timed out, killing container");
                self.kill(&container_id).await;
                None
            }
        };
        let timed_out = output.is_none();

        let inspect = self
            .docker
            .inspect_container(&container_id, None::<InspectContainerOptions>)
            .await?;
        sampler.abort();
        let oom_killed = inspect
            .state
            .and_then(|state| state.oom_killed)
            .unwrap_or(false);
        let peak_memory_kb = peak_bytes.load(Ordering::Relaxed) / 1024;

        self.remove(&container_id, &mut guard).await?;

        // The exec status is reported verbatim: Docker folds a signal death
        // into 128 + signal, indistinguishable from a program exiting with it
        let (stdout, stderr, exit_code) = match output {
            Some(output) => (output.stdout, output.stderr, output.exit_code),
            None => (OutputCapture::new(0), OutputCapture::new(0), None),
        };
        let memory_exceeded = !timed_out
            && killed_for_memory(oom_killed, exit_code, peak_memory_kb, job.limits.memory_limit_kb());

        debug!(
            exit_code = ?exit_code,
            oom_killed,
            memory_exceeded,
            wall_time_ms,
            peak_memory_kb,
            "Container run finished"
        );

        Ok(RunOutcome {
            output_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            exit_code: exit_code.map(|code| code as i32),
            signal: None,
            wall_time_ms,
            peak_memory_kb,
            timed_out,
            memory_exceeded,
            compile_failed: false,
        })
    }
}
