//! Single-container targets.
//!
//! The container engine is a trait so the escalation logic can be exercised
//! without a container runtime. [`DockerCli`] drives any docker-compatible
//! CLI (`docker`, `podman`).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blobcheck_core::obs;
use blobcheck_core::{
    ContainerSpec, HarnessError, HarnessResult, ResourceLimits, SecretBag, StartStrategy,
    TargetSpec,
};
use tracing::{debug, info};

use super::{Launch, StopTier, TargetResource, TargetStrategy};
use crate::runner::{StageError, StageRunner};
use crate::stage::StageConfig;

/// Label put on every container the harness creates.
pub const OWNER_LABEL: &str = "io.blobcheck.target";

const RUN_TIMEOUT_SECS: u64 = 600;
const INSPECT_TIMEOUT_SECS: u64 = 30;

/// Container engine failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected output from `{command}`: {output:?}")]
    Parse { command: String, output: String },
}

/// Everything needed to create one container.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub name: String,
    pub image: String,
    pub ports: Vec<u16>,
    pub volumes: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub secrets: SecretBag,
    pub args: Vec<String>,
    pub limits: ResourceLimits,
    pub labels: BTreeMap<String, String>,
}

impl RunRequest {
    /// `run` argv after the program name. Secret values are passed through
    /// the CLI's own environment, never on the command line.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];
        for (k, v) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{k}={v}"));
        }
        for port in &self.ports {
            args.push("-p".to_string());
            args.push(format!("127.0.0.1::{port}"));
        }
        for volume in &self.volumes {
            args.push("--mount".to_string());
            args.push(format!("type=tmpfs,destination={volume}"));
        }
        if let Some(mb) = self.limits.memory_mb {
            args.push("--memory".to_string());
            args.push(format!("{mb}m"));
        }
        if let Some(cpus) = self.limits.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(pids) = self.limits.pids {
            args.push("--pids-limit".to_string());
            args.push(pids.to_string());
        }
        for (k, v) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }
        for key in self.secrets.keys() {
            args.push("-e".to_string());
            args.push(key.clone());
        }
        args.push(self.image.clone());
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Operations the container strategy needs from a runtime.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create and start a container; returns its id.
    async fn run(&self, request: &RunRequest) -> Result<String, EngineError>;

    /// Host port published for `container_port`.
    async fn host_port(&self, id: &str, container_port: u16) -> Result<u16, EngineError>;

    /// Graceful stop, letting the runtime wait `grace` before killing.
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), EngineError>;

    /// Forced removal.
    async fn remove(&self, id: &str) -> Result<(), EngineError>;
}

/// Docker-compatible CLI engine.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn invoke(
        &self,
        args: Vec<String>,
        timeout_secs: u64,
        env: &SecretBag,
    ) -> Result<String, EngineError> {
        let mut argv = vec![self.program.clone()];
        argv.extend(args);
        let command = argv[..argv.len().min(3)].join(" ");
        let stage = StageConfig::new(command.clone(), argv, timeout_secs)
            .with_env(env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let result = StageRunner::execute_stage(&stage).await?;
        if !result.passed() {
            return Err(EngineError::Failed {
                command,
                status: match (result.exit_code, result.signal) {
                    (Some(code), _) => format!("code {code}"),
                    (None, Some(sig)) => format!("signal {sig}"),
                    (None, None) => "unknown status".to_string(),
                },
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(result.stdout)
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn run(&self, request: &RunRequest) -> Result<String, EngineError> {
        let stdout = self
            .invoke(request.to_args(), RUN_TIMEOUT_SECS, &request.secrets)
            .await?;
        let id = stdout.lines().last().unwrap_or_default().trim().to_string();
        if id.is_empty() {
            return Err(EngineError::Parse {
                command: format!("{} run", self.program),
                output: stdout,
            });
        }
        Ok(id)
    }

    async fn host_port(&self, id: &str, container_port: u16) -> Result<u16, EngineError> {
        let args = vec![
            "port".to_string(),
            id.to_string(),
            format!("{container_port}/tcp"),
        ];
        let stdout = self
            .invoke(args, INSPECT_TIMEOUT_SECS, &SecretBag::default())
            .await?;
        parse_port_output(&stdout).ok_or_else(|| EngineError::Parse {
            command: format!("{} port", self.program),
            output: stdout,
        })
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), EngineError> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            grace.as_secs().to_string(),
            id.to_string(),
        ];
        // Unbounded here; the caller bounds the whole tier.
        self.invoke(args, 0, &SecretBag::default()).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        let args = vec!["rm".to_string(), "-f".to_string(), id.to_string()];
        self.invoke(args, 0, &SecretBag::default()).await.map(|_| ())
    }
}

/// Parse `docker port` output such as `127.0.0.1:49153` or `[::]:49153`.
pub fn parse_port_output(output: &str) -> Option<u16> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(|line| line.rsplit(':').next()?.parse().ok())
}

/// Starts targets from a container image.
pub struct ContainerStrategy {
    engine: Arc<dyn ContainerEngine>,
}

impl ContainerStrategy {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    fn request(spec: &TargetSpec, container: &ContainerSpec) -> RunRequest {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let mut labels = BTreeMap::new();
        labels.insert(OWNER_LABEL.to_string(), spec.name.clone());
        RunRequest {
            name: format!("blobcheck-{}-{}", sanitize(&spec.name), &suffix[..8]),
            image: container.image.clone(),
            ports: container.ports.clone(),
            volumes: container.volumes.clone(),
            env: container.env.clone(),
            secrets: spec.secrets.clone(),
            args: container.args.clone(),
            limits: spec.limits.clone(),
            labels,
        }
    }
}

#[async_trait]
impl TargetStrategy for ContainerStrategy {
    fn kind(&self) -> &'static str {
        "container"
    }

    async fn launch(&self, spec: &TargetSpec) -> HarnessResult<Launch> {
        let StartStrategy::Container(container) = &spec.strategy else {
            return Err(HarnessError::Configuration(format!(
                "target {} is not a container target",
                spec.name
            )));
        };

        let request = Self::request(spec, container);
        info!(target_name = %spec.name, image = %request.image, container = %request.name, "starting container");
        let id = self
            .engine
            .run(&request)
            .await
            .map_err(|e| HarnessError::startup(&spec.name, e))?;

        let mut resource = ContainerResource::new(
            self.engine.clone(),
            id.clone(),
            spec.name.clone(),
            Duration::from_secs(container.stop_timeout_secs),
            Duration::from_secs(container.remove_timeout_secs),
        );

        let mut ports = Vec::with_capacity(container.ports.len());
        for port in &container.ports {
            match self.engine.host_port(&id, *port).await {
                Ok(host) => ports.push(host),
                Err(e) => {
                    if let Err(cleanup) = resource.release().await {
                        obs::emit_cleanup_failed(&spec.name, "all", &cleanup.to_string());
                    }
                    return Err(HarnessError::startup(
                        &spec.name,
                        format!("no host port for {port}: {e}"),
                    ));
                }
            }
        }
        debug!(target_name = %spec.name, container_id = %id, ?ports, "container ports mapped");

        let mut identifiers = BTreeMap::new();
        identifiers.insert("container_id".to_string(), id);
        identifiers.insert("container_name".to_string(), request.name);
        identifiers.insert("image".to_string(), request.image);

        Ok(Launch {
            ports,
            resource: Box::new(resource),
            identifiers,
            logs: None,
        })
    }
}

/// A running container and its two-tier stop.
pub struct ContainerResource {
    engine: Arc<dyn ContainerEngine>,
    id: String,
    target: String,
    stop_bound: Duration,
    remove_bound: Duration,
}

impl ContainerResource {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        id: String,
        target: String,
        stop_bound: Duration,
        remove_bound: Duration,
    ) -> Self {
        Self {
            engine,
            id,
            target,
            stop_bound,
            remove_bound,
        }
    }
}

#[async_trait]
impl TargetResource for ContainerResource {
    async fn release(&mut self) -> HarnessResult<StopTier> {
        let graceful = tokio::time::timeout(
            self.stop_bound,
            self.engine
                .stop(&self.id, self.stop_bound.saturating_sub(Duration::from_secs(1))),
        )
        .await;
        match graceful {
            Ok(Ok(())) => return Ok(StopTier::Graceful),
            Ok(Err(e)) => obs::emit_cleanup_failed(&self.target, "graceful", &e.to_string()),
            Err(_) => obs::emit_cleanup_failed(
                &self.target,
                "graceful",
                &format!("timed out after {}ms", self.stop_bound.as_millis()),
            ),
        }

        match tokio::time::timeout(self.remove_bound, self.engine.remove(&self.id)).await {
            Ok(Ok(())) => Ok(StopTier::Forced),
            Ok(Err(e)) => Err(HarnessError::cleanup(
                &self.target,
                format!("container {}: forced removal failed: {e}", self.id),
            )),
            Err(_) => Err(HarnessError::cleanup(
                &self.target,
                format!(
                    "container {}: forced removal timed out after {}ms",
                    self.id,
                    self.remove_bound.as_millis()
                ),
            )),
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}
