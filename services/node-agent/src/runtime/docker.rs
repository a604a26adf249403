//! Docker CLI runtime.
//!
//! Containers are named `kiln-{server_id}`, so a repeated create finds the
//! container an earlier attempt already made.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use kiln_protocol::{ContainerRef, ContainerSpec, ContainerState, ContainerStatus};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{validate_ref, ConsoleStreams, ContainerRuntime, RuntimeError, RuntimeResult};

const SERVER_LABEL: &str = "kiln.server_id";

struct CliOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

pub struct DockerRuntime {
    docker_bin: PathBuf,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(path: impl Into<PathBuf>) -> Self {
        Self {
            docker_bin: path.into(),
        }
    }

    async fn docker(&self, args: &[String]) -> RuntimeResult<CliOutput> {
        debug!(args = ?args, "docker");
        let output = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RuntimeError::Failed(format!("failed to run docker: {e}")))?;
        Ok(CliOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run a command against one container, mapping "no such container".
    async fn on_container(&self, container: &ContainerRef, args: Vec<String>) -> RuntimeResult<()> {
        let out = self.docker(&args).await?;
        if out.success {
            return Ok(());
        }
        if is_missing(&out.stderr) {
            return Err(RuntimeError::NotFound(container.clone()));
        }
        Err(RuntimeError::Failed(out.stderr))
    }

    async fn status(&self, container: &ContainerRef) -> RuntimeResult<ContainerStatus> {
        let state = self.inspect(container).await?;
        Ok(ContainerStatus {
            container_ref: container.clone(),
            state,
        })
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

fn parse_state(raw: &str) -> ContainerState {
    match raw.trim() {
        "created" => ContainerState::Created,
        "running" | "restarting" | "paused" => ContainerState::Running,
        _ => ContainerState::Exited,
    }
}

/// `--cpus` value for a plan given in hundredths of a core.
fn cpus_arg(hundredths: u64) -> String {
    format!("{}.{:02}", hundredths / 100, hundredths % 100)
}

fn create_args(spec: &ContainerSpec, name: &str) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--interactive".to_string(),
        "--label".to_string(),
        format!("{SERVER_LABEL}={}", spec.server_id),
        "--publish".to_string(),
        format!("{}:{}", spec.host_port, spec.container_port),
    ];
    if spec.resources.cpu > 0 {
        args.push("--cpus".to_string());
        args.push(cpus_arg(spec.resources.cpu));
    }
    if spec.resources.ram_mb > 0 {
        args.push("--memory".to_string());
        args.push(format!("{}m", spec.resources.ram_mb));
    }
    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerStatus> {
        let container = ContainerRef::new(spec.container_name());
        validate_ref(&container)?;
        if spec.image.is_empty() || spec.image.starts_with('-') {
            return Err(RuntimeError::Invalid(format!("invalid image '{}'", spec.image)));
        }

        let existing = self.inspect(&container).await?;
        if existing != ContainerState::Missing {
            debug!(container = %container, state = ?existing, "Container already exists");
            return Ok(ContainerStatus {
                container_ref: container,
                state: existing,
            });
        }

        let out = self.docker(&create_args(spec, container.as_str())).await?;
        if !out.success {
            // A concurrent create may have won the name.
            if out.stderr.contains("Conflict") {
                return self.status(&container).await;
            }
            return Err(RuntimeError::Failed(out.stderr));
        }

        info!(
            container = %container,
            image = %spec.image,
            host_port = spec.host_port,
            "Container created"
        );
        Ok(ContainerStatus {
            container_ref: container,
            state: ContainerState::Created,
        })
    }

    async fn start(&self, container: &ContainerRef) -> RuntimeResult<ContainerStatus> {
        validate_ref(container)?;
        self.on_container(
            container,
            vec!["start".to_string(), container.as_str().to_string()],
        )
        .await?;
        info!(container = %container, "Container started");
        self.status(container).await
    }

    async fn stop(
        &self,
        container: &ContainerRef,
        grace: Duration,
    ) -> RuntimeResult<ContainerStatus> {
        validate_ref(container)?;
        self.on_container(
            container,
            vec![
                "stop".to_string(),
                "--time".to_string(),
                grace.as_secs().to_string(),
                container.as_str().to_string(),
            ],
        )
        .await?;
        info!(container = %container, "Container stopped");
        self.status(container).await
    }

    async fn remove(&self, container: &ContainerRef) -> RuntimeResult<()> {
        validate_ref(container)?;
        match self
            .on_container(
                container,
                vec![
                    "rm".to_string(),
                    "--force".to_string(),
                    container.as_str().to_string(),
                ],
            )
            .await
        {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                info!(container = %container, "Container removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, container: &ContainerRef) -> RuntimeResult<ContainerState> {
        validate_ref(container)?;
        let out = self
            .docker(&[
                "inspect".to_string(),
                "--type".to_string(),
                "container".to_string(),
                "--format".to_string(),
                "{{.State.Status}}".to_string(),
                container.as_str().to_string(),
            ])
            .await?;
        if out.success {
            return Ok(parse_state(&out.stdout));
        }
        if is_missing(&out.stderr) {
            return Ok(ContainerState::Missing);
        }
        Err(RuntimeError::Failed(out.stderr))
    }

    async fn attach(&self, container: &ContainerRef) -> RuntimeResult<ConsoleStreams> {
        match self.inspect(container).await? {
            ContainerState::Running => {}
            ContainerState::Missing => return Err(RuntimeError::NotFound(container.clone())),
            _ => return Err(RuntimeError::NotRunning(container.clone())),
        }

        let mut child = Command::new(&self.docker_bin)
            .args(["attach", "--sig-proxy=false", container.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Failed(format!("failed to run docker attach: {e}")))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            warn!(container = %container, "docker attach spawned without stdio pipes");
            return Err(RuntimeError::Failed("attach stdio unavailable".into()));
        };

        debug!(container = %container, "Attached to container");
        let mut streams =
            ConsoleStreams::new(Box::new(stdout), Some(Box::new(stderr)), Box::new(stdin));
        streams.process = Some(child);
        Ok(streams)
    }
}
