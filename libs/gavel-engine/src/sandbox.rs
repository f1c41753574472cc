/// Sandbox Executor - runs untrusted code in a locked-down container
///
/// **Core Responsibility:**
/// Stage code and input, compile if the language needs it, run once against
/// the input, and report how the process ended.
///
/// **Critical Architectural Boundary:**
/// - Executor knows HOW to execute (Docker, mounts, limits)
/// - Executor does NOT compare output against expectations
/// - Executor never returns an error: infrastructure failures come back as
///   `Classification::SystemError` so callers always get an outcome
///
/// **Container Rules:**
/// - Read-only root filesystem, workspace mounted read-only at `/workspace`
/// - Writable tmpfs scratch at `/tmp`, `noexec` unless the profile runs a native binary
/// - Non-root user, all capabilities dropped, `no-new-privileges`
/// - No network
/// - Memory (swap included), CPU, pids, nproc and nofile ceilings
/// - Memory is the per-run limit when one is given, capped at the profile's
/// - Compile and run are separate execs; the container is force-removed before
///   the outcome is returned, with a drop guard for panics and cancellation

use crate::classify::{classify_run, OutputCapture, RunEvidence};
use crate::languages::{LanguageProfile, LanguageRegistry};
use crate::workspace::{Workspace, WorkspaceManager, INPUT_FILE};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StatsOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures_util::stream::StreamExt;
use gavel_common::config::EngineConfig;
use gavel_common::types::{Classification, ExecutionLimits, ExecutionOutcome, ExecutionRequest};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const WORKSPACE_MOUNT: &str = "/workspace";
const SCRATCH_MOUNT: &str = "/tmp";
/// Extra lifetime for the keepalive process beyond every step deadline.
const KEEPALIVE_MARGIN_SECS: u64 = 30;
/// Docker refuses memory limits below 6 MiB.
const MIN_MEMORY_BYTES: i64 = 6 * 1024 * 1024;

/// Seam between the judge and whatever actually runs code.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run one request to completion. Always produces exactly one outcome.
    async fn run(&self, request: &ExecutionRequest, limits: &ExecutionLimits) -> ExecutionOutcome;
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub sandbox_user: String,
    pub outer_timeout_slack: Duration,
    pub compile_timeout: Duration,
    pub max_output_bytes: usize,
}

impl SandboxSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            sandbox_user: config.sandbox_user.clone(),
            outer_timeout_slack: Duration::from_millis(config.outer_timeout_slack_ms),
            compile_timeout: Duration::from_millis(config.compile_timeout_ms),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if execution panics or is cancelled
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
    armed: bool,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
            armed: true,
        }
    }

    /// The container was already removed on the normal path.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        // Drop cannot be async; hand removal to the runtime
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(container_id = %container_id, "No runtime available, container left behind");
                return;
            }
        };

        handle.spawn(async move { force_remove(&docker, &container_id).await });
    }
}

async fn force_remove(docker: &Docker, container_id: &str) {
    let remove_options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };

    match docker.remove_container(container_id, Some(remove_options)).await {
        Ok(()) => debug!(container_id = %container_id, "Container removed"),
        Err(e) => warn!(container_id = %container_id, error = %e, "Failed to remove container"),
    }
}

/// Container memory ceiling: the requested limit, never above the profile's.
fn memory_ceiling_bytes(profile: &LanguageProfile, limits: &ExecutionLimits) -> i64 {
    let ceiling = profile.memory_limit_bytes();
    let requested = limits
        .memory_limit_mb
        .map(|mb| i64::try_from(mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX));

    match requested {
        Some(bytes) => bytes.clamp(MIN_MEMORY_BYTES, ceiling.max(MIN_MEMORY_BYTES)),
        None => ceiling,
    }
}

/// Result of one `exec` inside the container.
struct StepCapture {
    output: OutputCapture,
    exit_code: Option<i64>,
    timed_out: bool,
    elapsed_ms: u64,
}

/// Docker-backed sandbox. Holds one injected client for its whole lifetime.
pub struct DockerSandbox {
    docker: Docker,
    registry: Arc<LanguageRegistry>,
    workspaces: WorkspaceManager,
    settings: SandboxSettings,
}

impl DockerSandbox {
    pub fn new(
        docker: Docker,
        registry: Arc<LanguageRegistry>,
        workspaces: WorkspaceManager,
        settings: SandboxSettings,
    ) -> Self {
        Self {
            docker,
            registry,
            workspaces,
            settings,
        }
    }

    /// Connect to the local Docker daemon and prepare the workspace root.
    pub fn connect(config: &EngineConfig, registry: Arc<LanguageRegistry>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        let workspaces = WorkspaceManager::new(&config.workspace_root)?;
        Ok(Self::new(
            docker,
            registry,
            workspaces,
            SandboxSettings::from_config(config),
        ))
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await.context("Docker daemon unreachable")?;
        Ok(())
    }

    /// Ensure Docker image is available (pull if needed)
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = Box::pin(self.docker.create_image(options, None, None));
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    fn container_config(
        &self,
        profile: &LanguageProfile,
        workspace: &Workspace,
        memory_bytes: i64,
        keepalive_secs: u64,
    ) -> Config<String> {
        let limit = |name: &str, value: i64| ResourcesUlimits {
            name: Some(name.to_string()),
            soft: Some(value),
            hard: Some(value),
        };

        let exec_flag = if profile.scratch_exec { "exec" } else { "noexec" };
        let tmpfs = HashMap::from([(
            SCRATCH_MOUNT.to_string(),
            format!("rw,{},nosuid,size={}m,mode=1777", exec_flag, profile.tmpfs_size_mb),
        )]);

        Config {
            image: Some(profile.image.clone()),
            entrypoint: Some(vec![]),
            cmd: Some(vec!["sleep".to_string(), keepalive_secs.to_string()]),
            user: Some(self.settings.sandbox_user.clone()),
            env: Some(vec![
                format!("HOME={}", SCRATCH_MOUNT),
                format!("TMPDIR={}", SCRATCH_MOUNT),
            ]),
            working_dir: Some(SCRATCH_MOUNT.to_string()),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(memory_bytes),
                memory_swap: Some(memory_bytes),
                nano_cpus: Some(profile.nano_cpus()),
                pids_limit: Some(profile.pids_limit),
                ulimits: Some(vec![
                    limit("nproc", profile.pids_limit),
                    limit("nofile", profile.nofile_limit),
                ]),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                readonly_rootfs: Some(true),
                network_mode: Some("none".to_string()),
                binds: Some(vec![workspace.read_only_bind(WORKSPACE_MOUNT)]),
                tmpfs: Some(tmpfs),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn execute(
        &self,
        job_id: Uuid,
        request: &ExecutionRequest,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionOutcome> {
        let profile = self
            .registry
            .get(request.language)
            .ok_or_else(|| anyhow!("No profile configured for language {}", request.language))?;

        // Dropped on every exit path below, after the container guard.
        let workspace = self
            .workspaces
            .acquire(job_id, profile, &request.code, &request.input)
            .await?;

        self.ensure_image(&profile.image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", profile.image))?;

        let time_limit_ms = limits.time_limit_ms.unwrap_or(profile.wall_clock_timeout_ms);
        let run_deadline =
            Duration::from_millis(time_limit_ms).saturating_add(self.settings.outer_timeout_slack);
        let keepalive_secs = self
            .settings
            .compile_timeout
            .saturating_add(run_deadline)
            .as_secs()
            .saturating_add(KEEPALIVE_MARGIN_SECS);

        let memory_bytes = memory_ceiling_bytes(profile, limits);
        let config = self.container_config(profile, &workspace, memory_bytes, keepalive_secs);
        let container_name = format!("gavel-{}", job_id);
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create Docker container")?;

        let container_id = container.id;
        let mut guard = ContainerGuard::new(&self.docker, container_id.clone());

        let result = self
            .run_in_container(job_id, request, profile, &container_id, time_limit_ms, run_deadline)
            .await;

        // Awaited here: a short-lived caller may shut its runtime down right after.
        force_remove(&self.docker, &container_id).await;
        guard.disarm();

        result
    }

    /// Start the container, compile if needed, then run against the staged input.
    async fn run_in_container(
        &self,
        job_id: Uuid,
        request: &ExecutionRequest,
        profile: &LanguageProfile,
        container_id: &str,
        time_limit_ms: u64,
        run_deadline: Duration,
    ) -> Result<ExecutionOutcome> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        if let Some(compile_command) = &profile.compile_command {
            let step = self
                .exec_step(container_id, compile_command, self.settings.compile_timeout)
                .await
                .context("Compilation step failed to run")?;

            if let Some(outcome) = compilation_failure(job_id, step)? {
                warn!(job_id = %job_id, language = %request.language, "Compilation failed");
                return Ok(outcome);
            }
            debug!(job_id = %job_id, "Compilation succeeded");
        }

        let run_command = format!(
            "timeout {} {} < {}/{}",
            format_seconds(time_limit_ms),
            profile.run_command,
            WORKSPACE_MOUNT,
            INPUT_FILE
        );

        let step = self
            .exec_step(container_id, &run_command, run_deadline)
            .await
            .context("Run step failed to execute")?;

        let oom_killed = self.oom_killed(container_id).await;
        let memory_used_kb = if step.timed_out {
            None
        } else {
            self.peak_memory_kb(container_id).await
        };

        let stderr = step.output.stderr();
        let classification = classify_run(
            &RunEvidence {
                exit_code: step.exit_code,
                outer_timeout: step.timed_out,
                oom_killed,
                elapsed_ms: step.elapsed_ms,
                time_limit_ms,
                stderr: &stderr,
            },
            &profile.syntax_error_markers,
        );

        if classification == Classification::SystemError {
            bail!("Run step ended without an exit status");
        }

        let success = classification == Classification::Success;
        let stdout = if success {
            step.output.stdout().trim().to_string()
        } else {
            step.output.stdout()
        };

        Ok(ExecutionOutcome {
            job_id,
            success,
            classification,
            stdout,
            stderr,
            exit_code: step.exit_code,
            wall_time_ms: step.elapsed_ms,
            memory_used_kb,
            output_truncated: step.output.truncated(),
        })
    }

    /// Run one shell command in the container under a hard deadline.
    ///
    /// On expiry the whole container is killed; output captured up to that
    /// point is kept.
    async fn exec_step(&self, container_id: &str, command: &str, deadline: Duration) -> Result<StepCapture> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(SCRATCH_MOUNT.to_string()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container_id, exec_config)
            .await
            .context("Failed to create exec")?;

        let mut output = OutputCapture::new(self.settings.max_output_bytes);
        let start_time = Instant::now();

        let collected = tokio::time::timeout(deadline, async {
            let start_config = StartExecOptions {
                detach: false,
                ..Default::default()
            };

            match self.docker.start_exec(&exec.id, Some(start_config)).await? {
                StartExecResults::Attached { output: mut stream, .. } => {
                    while let Some(msg) = stream.next().await {
                        match msg {
                            Ok(LogOutput::StdOut { message }) => output.push_stdout(&message),
                            Ok(LogOutput::StdErr { message }) => output.push_stderr(&message),
                            Ok(_) => {}
                            Err(e) => {
                                output.push_stderr_note(&format!("\n[output stream error: {}]", e));
                                break;
                            }
                        }
                    }
                }
                StartExecResults::Detached => bail!("Exec started detached"),
            }

            let inspect = self.docker.inspect_exec(&exec.id).await?;
            Ok::<Option<i64>, anyhow::Error>(inspect.exit_code)
        })
        .await;

        let elapsed_ms = start_time.elapsed().as_millis() as u64;

        match collected {
            Ok(Ok(exit_code)) => Ok(StepCapture {
                output,
                exit_code,
                timed_out: false,
                elapsed_ms,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    container_id = %container_id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Step exceeded wall-clock deadline, killing container"
                );
                if let Err(e) = self
                    .docker
                    .kill_container(container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container_id = %container_id, error = %e, "Failed to kill timed-out container");
                }
                output.push_stderr_note("\n[Execution timed out]");
                Ok(StepCapture {
                    output,
                    exit_code: None,
                    timed_out: true,
                    elapsed_ms,
                })
            }
        }
    }

    async fn oom_killed(&self, container_id: &str) -> bool {
        self.docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .ok()
            .and_then(|info| info.state)
            .and_then(|state| state.oom_killed)
            .unwrap_or(false)
    }

    /// Best-effort peak memory of the container in KiB.
    ///
    /// cgroup v1 reports a true peak; on v2 only current usage is available.
    async fn peak_memory_kb(&self, container_id: &str) -> Option<u64> {
        let options = Some(StatsOptions {
            stream: false,
            one_shot: true,
        });
        let mut stream = Box::pin(self.docker.stats(container_id, options));

        match stream.next().await {
            Some(Ok(stats)) => stats
                .memory_stats
                .max_usage
                .or(stats.memory_stats.usage)
                .map(|bytes| bytes / 1024),
            Some(Err(e)) => {
                debug!(container_id = %container_id, error = %e, "Memory stats unavailable");
                None
            }
            None => None,
        }
    }
}

/// `None` if compilation succeeded, otherwise the terminal outcome.
fn compilation_failure(job_id: Uuid, step: StepCapture) -> Result<Option<ExecutionOutcome>> {
    let mut stderr = step.output.stderr();

    if step.timed_out {
        stderr.push_str("\n[Compilation timed out]");
    } else {
        match step.exit_code {
            Some(0) => return Ok(None),
            Some(_) => {}
            None => bail!("Compiler exited without an exit status"),
        }
    }

    // Some toolchains report diagnostics on stdout.
    if stderr.trim().is_empty() {
        stderr = step.output.stdout();
    }

    Ok(Some(ExecutionOutcome {
        job_id,
        success: false,
        classification: Classification::CompilationError,
        stdout: String::new(),
        stderr,
        exit_code: step.exit_code,
        wall_time_ms: step.elapsed_ms,
        memory_used_kb: None,
        output_truncated: step.output.truncated(),
    }))
}

fn format_seconds(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

#[async_trait]
impl Sandbox for DockerSandbox {
    #[instrument(skip(self, request), fields(language = %request.language))]
    async fn run(&self, request: &ExecutionRequest, limits: &ExecutionLimits) -> ExecutionOutcome {
        let job_id = Uuid::new_v4();
        let start = Instant::now();

        info!(
            job_id = %job_id,
            code_bytes = request.code.len(),
            input_bytes = request.input.len(),
            time_limit_ms = ?limits.time_limit_ms,
            memory_limit_mb = ?limits.memory_limit_mb,
            "Starting sandboxed execution"
        );

        match self.execute(job_id, request, limits).await {
            Ok(outcome) => {
                info!(
                    job_id = %job_id,
                    classification = outcome.classification.as_str(),
                    exit_code = ?outcome.exit_code,
                    wall_time_ms = outcome.wall_time_ms,
                    memory_used_kb = ?outcome.memory_used_kb,
                    "Execution finished"
                );
                outcome
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(job_id = %job_id, error = %message, "Sandbox infrastructure failure");
                ExecutionOutcome::system_error(job_id, message, start.elapsed().as_millis() as u64)
            }
        }
    }
}
