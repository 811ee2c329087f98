//! Target lifecycle controller.
//!
//! `Controller::start` is the only way to obtain a [`StartedTarget`], and a
//! started target is the only way to reach its stop sequence, so a caller
//! cannot start a target without holding what is needed to clean it up.
//!
//! ```text
//! Unstarted ──► Starting ──► Ready ──► Running ──► Stopping ──► Stopped
//!                   │                                  ▲
//!                   └──── launch ok, probe failed ─────┘
//! ```
//!
//! Each start strategy lives in its own module behind [`TargetStrategy`];
//! the strategy is picked once per target from its descriptor.

pub mod command;
pub mod compose;
pub mod container;
pub mod signal;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use blobcheck_core::obs;
use blobcheck_core::{CapabilitySet, HarnessError, HarnessResult, StartStrategy, TargetSpec};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::logbuf::{render_shared, SharedLogRing};
use crate::probe::{HealthProber, ProbeConfig};
use crate::runtime::RuntimeEnv;

pub use command::CommandStrategy;
pub use compose::ComposeStrategy;
pub use container::{ContainerEngine, ContainerStrategy, DockerCli, EngineError, RunRequest};

/// Lines of target output included in a startup failure log.
const STARTUP_TAIL_LINES: usize = 20;

/// Lifecycle states of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unstarted,
    Starting,
    Ready,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Unstarted => "unstarted",
            LifecycleState::Starting => "starting",
            LifecycleState::Ready => "ready",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        }
    }
}

/// Which escalation tier ended a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopTier {
    /// Nothing was running any more.
    AlreadyExited,
    Graceful,
    Forced,
}

impl StopTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopTier::AlreadyExited => "already_exited",
            StopTier::Graceful => "graceful",
            StopTier::Forced => "forced",
        }
    }
}

/// Whatever a strategy allocated: a container, a compose driver, a process.
#[async_trait]
pub trait TargetResource: Send {
    /// Run the strategy's full stop sequence. Every tier is bounded.
    async fn release(&mut self) -> HarnessResult<StopTier>;
}

/// Output of a successful launch, before readiness is known.
pub struct Launch {
    /// Host ports, in placeholder order.
    pub ports: Vec<u16>,
    pub resource: Box<dyn TargetResource>,
    /// Strategy-specific identifiers (container id, pid, project).
    pub identifiers: BTreeMap<String, String>,
    pub logs: Option<SharedLogRing>,
}

/// One way of bringing a target up.
#[async_trait]
pub trait TargetStrategy: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Allocate the target. On error, anything partially allocated must
    /// already be released.
    async fn launch(&self, spec: &TargetSpec) -> HarnessResult<Launch>;
}

/// Descriptive facts about a started target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetMetadata {
    pub strategy: &'static str,
    pub started_at: DateTime<Utc>,
    pub startup_ms: u64,
    pub identifiers: BTreeMap<String, String>,
}

/// Owns the resource and releases it at most once.
struct StopHandle {
    resource: Option<Box<dyn TargetResource>>,
}

impl StopHandle {
    fn new(resource: Box<dyn TargetResource>) -> Self {
        Self {
            resource: Some(resource),
        }
    }

    fn is_armed(&self) -> bool {
        self.resource.is_some()
    }

    async fn release(&mut self) -> Option<HarnessResult<StopTier>> {
        let mut resource = self.resource.take()?;
        Some(resource.release().await)
    }
}

/// A target that passed its readiness probe.
pub struct StartedTarget {
    pub name: String,
    pub base_url: String,
    pub capabilities: CapabilitySet,
    pub metadata: TargetMetadata,
    logs: Option<SharedLogRing>,
    state: LifecycleState,
    handle: StopHandle,
}

impl StartedTarget {
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn transition(&mut self, to: LifecycleState) {
        obs::emit_state_transition(&self.name, self.state.as_str(), to.as_str());
        self.state = to;
    }

    /// Ready → Running, once tests are about to be launched.
    pub fn mark_running(&mut self) {
        if self.state == LifecycleState::Ready {
            self.transition(LifecycleState::Running);
        }
    }

    /// Captured target output, when the strategy captures any.
    pub fn logs(&self) -> Option<String> {
        self.logs.as_ref().map(render_shared)
    }

    /// Run the stop sequence. Only the first call does anything; cleanup
    /// errors are logged and swallowed.
    pub async fn stop(&mut self) -> Option<StopTier> {
        if !self.handle.is_armed() {
            debug!(target_name = %self.name, "stop already executed");
            return None;
        }
        self.transition(LifecycleState::Stopping);
        let outcome = self.handle.release().await;
        self.transition(LifecycleState::Stopped);
        match outcome {
            Some(Ok(tier)) => Some(tier),
            Some(Err(e)) => {
                obs::emit_cleanup_failed(&self.name, "all", &e.to_string());
                None
            }
            None => None,
        }
    }
}

impl Drop for StartedTarget {
    fn drop(&mut self) {
        if self.handle.is_armed() {
            warn!(
                target_name = %self.name,
                "started target dropped without stop; relying on kill-on-drop"
            );
        }
    }
}

/// Starts targets and hands back stop-owning [`StartedTarget`]s.
pub struct Controller {
    env: RuntimeEnv,
    log_capacity: usize,
    prober: HealthProber,
}

impl Controller {
    pub fn new(env: RuntimeEnv, log_capacity: usize) -> HarnessResult<Self> {
        let prober = HealthProber::new().map_err(|e| HarnessError::Configuration(e.to_string()))?;
        Ok(Self {
            env,
            log_capacity,
            prober,
        })
    }

    /// Pick the strategy implementation for a descriptor.
    pub fn strategy_for(&self, spec: &TargetSpec) -> Box<dyn TargetStrategy> {
        match &spec.strategy {
            StartStrategy::Container(_) => Box::new(ContainerStrategy::new(Arc::new(
                DockerCli::new(self.env.container_cli.clone()),
            ))),
            StartStrategy::Compose(_) => {
                Box::new(ComposeStrategy::new(self.env.compose.clone(), self.log_capacity))
            }
            StartStrategy::Command(_) => Box::new(CommandStrategy::new(self.log_capacity)),
        }
    }

    pub async fn start(&self, spec: &TargetSpec) -> HarnessResult<StartedTarget> {
        let strategy = self.strategy_for(spec);
        self.start_with(spec, strategy.as_ref()).await
    }

    /// Start with an explicit strategy.
    pub async fn start_with(
        &self,
        spec: &TargetSpec,
        strategy: &dyn TargetStrategy,
    ) -> HarnessResult<StartedTarget> {
        let name = spec.name.as_str();
        obs::emit_state_transition(
            name,
            LifecycleState::Unstarted.as_str(),
            LifecycleState::Starting.as_str(),
        );
        let started_at = Utc::now();
        let clock = Instant::now();

        let launch = strategy.launch(spec).await?;
        let Launch {
            ports,
            resource,
            identifiers,
            logs,
        } = launch;
        let mut handle = StopHandle::new(resource);

        let readiness = match spec.resolve_base_url(&ports) {
            Ok(base_url) => {
                let url = spec.probe.url_for(&base_url);
                debug!(target_name = %name, url = %url, "probing readiness");
                self.prober
                    .wait(&url, &ProbeConfig::from(&spec.probe))
                    .await
                    .map(|_| base_url)
                    .map_err(|e| HarnessError::startup(name, e))
            }
            Err(e) => Err(e),
        };

        let base_url = match readiness {
            Ok(base_url) => base_url,
            Err(e) => {
                if let Some(ring) = &logs {
                    if let Ok(guard) = ring.lock() {
                        warn!(target_name = %name, output = %guard.tail(STARTUP_TAIL_LINES), "target output before failure");
                    }
                }
                obs::emit_state_transition(
                    name,
                    LifecycleState::Starting.as_str(),
                    LifecycleState::Stopping.as_str(),
                );
                if let Some(Err(cleanup)) = handle.release().await {
                    obs::emit_cleanup_failed(name, "all", &cleanup.to_string());
                }
                obs::emit_state_transition(
                    name,
                    LifecycleState::Stopping.as_str(),
                    LifecycleState::Stopped.as_str(),
                );
                return Err(e);
            }
        };

        let startup_ms = clock.elapsed().as_millis() as u64;
        obs::emit_state_transition(
            name,
            LifecycleState::Starting.as_str(),
            LifecycleState::Ready.as_str(),
        );
        obs::emit_target_ready(name, &base_url, startup_ms);

        Ok(StartedTarget {
            name: name.to_string(),
            base_url,
            capabilities: spec.capabilities.clone(),
            metadata: TargetMetadata {
                strategy: strategy.kind(),
                started_at,
                startup_ms,
                identifiers,
            },
            logs,
            state: LifecycleState::Ready,
            handle,
        })
    }
}
