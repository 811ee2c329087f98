//! Local-command targets.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use blobcheck_core::{resolve_template, HarnessError, HarnessResult, StartStrategy, TargetSpec};
use tokio::process::{Child, Command};
use tracing::info;

use super::signal::terminate_then_kill;
use super::{Launch, StopTier, TargetResource, TargetStrategy};
use crate::logbuf::{spawn_capture, LogRing, LogStream};

/// Prefix of the per-port environment variables, suffixed with the index.
pub const PORT_ENV_PREFIX: &str = "BLOBCHECK_PORT_";

/// Spawns the target directly as a child process.
pub struct CommandStrategy {
    log_capacity: usize,
}

impl CommandStrategy {
    pub fn new(log_capacity: usize) -> Self {
        Self { log_capacity }
    }
}

/// Replace each `0` with a free loopback port.
fn allocate_ports(declared: &[u16]) -> std::io::Result<Vec<u16>> {
    declared
        .iter()
        .map(|&port| {
            if port != 0 {
                return Ok(port);
            }
            let listener = TcpListener::bind(("127.0.0.1", 0))?;
            Ok(listener.local_addr()?.port())
        })
        .collect()
}

#[async_trait]
impl TargetStrategy for CommandStrategy {
    fn kind(&self) -> &'static str {
        "command"
    }

    async fn launch(&self, spec: &TargetSpec) -> HarnessResult<Launch> {
        let StartStrategy::Command(cmd) = &spec.strategy else {
            return Err(HarnessError::Configuration(format!(
                "target {} is not a command target",
                spec.name
            )));
        };

        let ports = allocate_ports(&cmd.ports)
            .map_err(|e| HarnessError::startup(&spec.name, format!("port allocation: {e}")))?;
        let argv = cmd
            .command
            .iter()
            .map(|arg| resolve_template(arg, &ports))
            .collect::<HarnessResult<Vec<_>>>()?;
        let Some((program, args)) = argv.split_first() else {
            return Err(HarnessError::Configuration(format!(
                "target {} has an empty command",
                spec.name
            )));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&cmd.env)
            .envs(
                ports
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (format!("{PORT_ENV_PREFIX}{i}"), p.to_string())),
            )
            .envs(spec.secrets.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(cwd) = &cmd.cwd {
            command.current_dir(cwd);
        }

        info!(target_name = %spec.name, program = %program, ?ports, "spawning target");
        let mut child = command.spawn().map_err(|e| {
            HarnessError::startup(&spec.name, format!("failed to spawn {program}: {e}"))
        })?;

        let ring = LogRing::shared(&spec.name, self.log_capacity);
        if let Some(stdout) = child.stdout.take() {
            spawn_capture(stdout, LogStream::Stdout, ring.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_capture(stderr, LogStream::Stderr, ring.clone());
        }

        let mut identifiers = BTreeMap::new();
        identifiers.insert("program".to_string(), program.clone());
        if let Some(pid) = child.id() {
            identifiers.insert("pid".to_string(), pid.to_string());
        }

        Ok(Launch {
            ports,
            resource: Box::new(ProcessResource {
                target: spec.name.clone(),
                child,
                grace: Duration::from_secs(cmd.grace_secs),
            }),
            identifiers,
            logs: Some(ring),
        })
    }
}

/// A directly spawned target process.
pub struct ProcessResource {
    target: String,
    child: Child,
    grace: Duration,
}

#[async_trait]
impl TargetResource for ProcessResource {
    async fn release(&mut self) -> HarnessResult<StopTier> {
        terminate_then_kill(&mut self.child, self.grace)
            .await
            .map_err(|e| HarnessError::cleanup(&self.target, e))
    }
}
