//! Container launch abstraction

use async_trait::async_trait;
use brood_core::config::ENV_DOCKER_CMD;
use brood_core::{BroodError, HelperId, Result};
use std::path::PathBuf;
use std::process::Output;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// A bind mount from the host into a helper container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: PathBuf,
    pub read_only: bool,
}

impl Mount {
    pub fn rw(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    pub fn ro(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    /// `-v` argument in `host:container[:ro]` form
    pub fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container.display());
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Everything needed to start one helper container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub identity: HelperId,
    /// Container name, unique per identity
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub entrypoint: Option<String>,
    pub command: Vec<String>,
    pub workdir: Option<PathBuf>,
}

/// Handle to a launched helper process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub identity: HelperId,
    pub name: String,
    /// Runtime-assigned id (container id for real launches)
    pub id: String,
}

/// How a terminate request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Terminated,
    /// Nothing was running; treated as success
    AlreadyExited,
}

/// Trait for starting and stopping helper processes (allows mocking in tests)
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start the helper described by `spec`
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle>;

    /// Stop a helper, forcing it after `grace`
    async fn terminate(&self, handle: &ProcessHandle, grace: Duration) -> Result<TerminateOutcome>;
}

/// Launches helpers with the podman or docker CLI
#[derive(Debug, Clone)]
pub struct ContainerLauncher {
    runtime: String,
}

impl ContainerLauncher {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }

    /// Pick the runtime: `BROOD_DOCKER_CMD`, then the configured one, then
    /// podman if it answers, then docker
    pub async fn detect(configured: Option<&str>) -> Self {
        if let Ok(cmd) = std::env::var(ENV_DOCKER_CMD) {
            if !cmd.trim().is_empty() {
                return Self::new(cmd.trim());
            }
        }
        if let Some(runtime) = configured {
            return Self::new(runtime);
        }

        let podman = Command::new("podman").arg("--version").output().await;
        match podman {
            Ok(output) if output.status.success() => Self::new("podman"),
            _ => Self::new("docker"),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Arguments for `<runtime> run`
    pub fn run_args(spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        if let Some(entrypoint) = &spec.entrypoint {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }
        if let Some(workdir) = &spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.display().to_string());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for mount in &spec.mounts {
            args.push("-v".to_string());
            args.push(mount.to_arg());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    async fn exec(&self, args: &[String]) -> Result<Output> {
        debug!("Executing {} {:?}", self.runtime, args);
        Command::new(&self.runtime)
            .args(args)
            .output()
            .await
            .map_err(|e| BroodError::Launch(format!("Failed to execute {}: {}", self.runtime, e)))
    }
}

fn is_missing_container(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such container") || stderr.contains("no container with name")
}

#[async_trait]
impl Launcher for ContainerLauncher {
    #[instrument(skip(self, spec), fields(runtime = %self.runtime, identity = spec.identity))]
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        // Leftover from an earlier launch of the same identity
        let _ = self
            .exec(&["rm".to_string(), "-f".to_string(), spec.name.clone()])
            .await;

        let output = self.exec(&Self::run_args(spec)).await?;
        if !output.status.success() {
            return Err(BroodError::Launch(format!(
                "{} run failed: {}",
                self.runtime,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(ProcessHandle {
            identity: spec.identity,
            name: spec.name.clone(),
            id,
        })
    }

    #[instrument(skip(self, handle), fields(runtime = %self.runtime, identity = handle.identity))]
    async fn terminate(&self, handle: &ProcessHandle, grace: Duration) -> Result<TerminateOutcome> {
        let stop = self
            .exec(&[
                "stop".to_string(),
                "-t".to_string(),
                grace.as_secs().to_string(),
                handle.name.clone(),
            ])
            .await?;

        let outcome = if stop.status.success() {
            TerminateOutcome::Terminated
        } else {
            let stderr = String::from_utf8_lossy(&stop.stderr).to_string();
            if !is_missing_container(&stderr) {
                return Err(BroodError::Launch(format!(
                    "{} stop failed: {}",
                    self.runtime,
                    stderr.trim()
                )));
            }
            TerminateOutcome::AlreadyExited
        };

        let rm = self
            .exec(&["rm".to_string(), "-f".to_string(), handle.name.clone()])
            .await?;
        if !rm.status.success() {
            warn!(
                "Failed to remove container {}: {}",
                handle.name,
                String::from_utf8_lossy(&rm.stderr).trim()
            );
        }
        Ok(outcome)
    }
}

#[derive(Debug, Default)]
struct MockState {
    launches: Vec<LaunchSpec>,
    terminated: Vec<HelperId>,
    failing: bool,
    exited: Vec<HelperId>,
    delay: Option<Duration>,
    terminate_delay: Option<Duration>,
    counter: u64,
}

/// Mock launcher for testing; records every call
#[derive(Debug, Clone, Default)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent launch fail
    pub fn fail_launches(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Delay launches, keeping them in flight for a while
    pub fn with_launch_delay(self, delay: Duration) -> Self {
        self.lock().delay = Some(delay);
        self
    }

    /// Delay terminations, keeping a stop in progress for a while
    pub fn with_terminate_delay(self, delay: Duration) -> Self {
        self.lock().terminate_delay = Some(delay);
        self
    }

    /// Report the helper's process as already gone on terminate
    pub fn mark_exited(&self, identity: HelperId) {
        self.lock().exited.push(identity);
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.lock().launches.clone()
    }

    pub fn launch_count(&self, identity: HelperId) -> usize {
        self.lock()
            .launches
            .iter()
            .filter(|spec| spec.identity == identity)
            .count()
    }

    pub fn terminated(&self) -> Vec<HelperId> {
        self.lock().terminated.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.launches.push(spec.clone());
        if state.failing {
            return Err(BroodError::Launch(format!("mock launch of {} failed", spec.name)));
        }
        state.counter += 1;
        state.exited.retain(|id| *id != spec.identity);
        Ok(ProcessHandle {
            identity: spec.identity,
            name: spec.name.clone(),
            id: format!("mock-{}", state.counter),
        })
    }

    async fn terminate(&self, handle: &ProcessHandle, _grace: Duration) -> Result<TerminateOutcome> {
        let delay = self.lock().terminate_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.terminated.push(handle.identity);
        if state.exited.contains(&handle.identity) {
            Ok(TerminateOutcome::AlreadyExited)
        } else {
            Ok(TerminateOutcome::Terminated)
        }
    }
}
