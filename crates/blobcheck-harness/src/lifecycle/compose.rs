//! Composed multi-process stacks.
//!
//! The stack is driven by a long-lived `compose up` subprocess. Any stale
//! stack with the same project id is torn down before starting, and the
//! teardown runs again on every stop whether or not the driver answered
//! its signals.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use blobcheck_core::obs;
use blobcheck_core::{ComposeSpec, HarnessError, HarnessResult, StartStrategy, TargetSpec};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::signal::terminate_then_kill;
use super::{Launch, StopTier, TargetResource, TargetStrategy};
use crate::logbuf::{spawn_capture, LogRing, LogStream};
use crate::runner::StageRunner;
use crate::stage::StageConfig;

/// Starts targets from a compose file.
pub struct ComposeStrategy {
    /// Compose argv prefix, e.g. `["docker", "compose"]`.
    compose: Vec<String>,
    log_capacity: usize,
}

impl ComposeStrategy {
    pub fn new(compose: Vec<String>, log_capacity: usize) -> Self {
        Self {
            compose,
            log_capacity,
        }
    }

    fn project_argv(&self, stack: &ComposeSpec) -> Vec<String> {
        let mut argv = self.compose.clone();
        argv.push("-p".to_string());
        argv.push(stack.project.clone());
        argv.push("-f".to_string());
        argv.push(stack.file.display().to_string());
        argv
    }

    /// `down` invocation for the stack, bounded by its teardown timeout.
    pub fn teardown_stage(&self, spec: &TargetSpec, stack: &ComposeSpec) -> StageConfig {
        let mut argv = self.project_argv(stack);
        argv.extend(["down", "-v", "--remove-orphans"].map(str::to_string));
        StageConfig::new(
            format!("compose down {}", stack.project),
            argv,
            stack.teardown_timeout_secs.max(1),
        )
        .with_env(spec.secrets.iter().map(|(k, v)| (k.clone(), v.clone())))
    }
}

#[async_trait]
impl TargetStrategy for ComposeStrategy {
    fn kind(&self) -> &'static str {
        "compose"
    }

    async fn launch(&self, spec: &TargetSpec) -> HarnessResult<Launch> {
        let StartStrategy::Compose(stack) = &spec.strategy else {
            return Err(HarnessError::Configuration(format!(
                "target {} is not a compose target",
                spec.name
            )));
        };
        let teardown = self.teardown_stage(spec, stack);

        // Stale stacks from a crashed run must not block this one.
        match StageRunner::execute_stage(&teardown).await {
            Ok(result) if result.passed() => {
                debug!(target_name = %spec.name, project = %stack.project, "stale stack teardown done")
            }
            Ok(result) => {
                debug!(target_name = %spec.name, exit_code = ?result.exit_code, "stale stack teardown failed; continuing")
            }
            Err(e) => debug!(target_name = %spec.name, error = %e, "stale stack teardown failed; continuing"),
        }

        let mut argv = self.project_argv(stack);
        argv.extend(["up", "--remove-orphans"].map(str::to_string));
        let Some((program, args)) = argv.split_first() else {
            return Err(HarnessError::Configuration(
                "empty compose command".to_string(),
            ));
        };

        info!(target_name = %spec.name, project = %stack.project, file = %stack.file.display(), "starting stack");
        let mut child = Command::new(program)
            .args(args)
            .envs(spec.secrets.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HarnessError::startup(&spec.name, format!("failed to spawn {program}: {e}")))?;

        let ring = LogRing::shared(&spec.name, self.log_capacity);
        if let Some(stdout) = child.stdout.take() {
            spawn_capture(stdout, LogStream::Stdout, ring.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_capture(stderr, LogStream::Stderr, ring.clone());
        }

        let mut identifiers = BTreeMap::new();
        identifiers.insert("project".to_string(), stack.project.clone());
        identifiers.insert("file".to_string(), stack.file.display().to_string());
        if let Some(pid) = child.id() {
            identifiers.insert("pid".to_string(), pid.to_string());
        }

        Ok(Launch {
            ports: stack.ports.clone(),
            resource: Box::new(ComposeResource {
                target: spec.name.clone(),
                child,
                grace: Duration::from_secs(stack.grace_secs),
                teardown,
            }),
            identifiers,
            logs: Some(ring),
        })
    }
}

/// The `compose up` driver plus the teardown that always follows it.
pub struct ComposeResource {
    target: String,
    child: Child,
    grace: Duration,
    teardown: StageConfig,
}

#[async_trait]
impl TargetResource for ComposeResource {
    async fn release(&mut self) -> HarnessResult<StopTier> {
        let signalled = terminate_then_kill(&mut self.child, self.grace).await;
        if let Err(e) = &signalled {
            obs::emit_cleanup_failed(&self.target, "signal", &e.to_string());
        }

        let teardown = match StageRunner::execute_stage(&self.teardown).await {
            Ok(result) if result.passed() => Ok(()),
            Ok(result) => Err(format!(
                "teardown exited with {:?}: {}",
                result.exit_code,
                result.stderr.trim()
            )),
            Err(e) => Err(e.to_string()),
        };

        match (signalled, teardown) {
            (Ok(tier), Ok(())) => Ok(tier),
            (Err(_), Ok(())) => Ok(StopTier::Forced),
            (_, Err(reason)) => Err(HarnessError::cleanup(&self.target, reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn spec() -> TargetSpec {
        let mut spec: TargetSpec = toml::from_str(
            r#"
strategy = "compose"
file = "stack.yml"
project = "bc-test"
ports = [8080]
grace_secs = 1
teardown_timeout_secs = 5
base_url = "http://127.0.0.1:{0}"
"#,
        )
        .expect("target toml");
        spec.name = "stack".to_string();
        spec
    }

    /// A fake compose CLI that records `down` calls and idles on `up`.
    fn fake_compose(dir: &Path) -> Vec<String> {
        let script = dir.join("compose.sh");
        let log = dir.join("calls.log");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nfor a in \"$@\"; do case \"$a\" in up|down) echo \"$a\" >> {log};; esac; done\ncase \"$*\" in *\" up \"*|*\" up\") echo stack up; exec sleep 30;; esac\n",
                log = log.display()
            ),
        )
        .expect("write script");
        vec!["sh".to_string(), script.display().to_string()]
    }

    #[tokio::test]
    async fn test_launch_tears_down_before_and_after() {
        let dir = tempfile::tempdir().expect("tempdir");
        let strategy = ComposeStrategy::new(fake_compose(dir.path()), 50);

        let mut launch = strategy.launch(&spec()).await.expect("launch");
        assert_eq!(launch.ports, vec![8080]);
        assert_eq!(launch.identifiers["project"], "bc-test");

        // Wait for the driver to come up before stopping it.
        let ring = launch.logs.clone().expect("compose output is captured");
        for _ in 0..50 {
            if crate::logbuf::render_shared(&ring).contains("stack up") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let tier = launch.resource.release().await.expect("release");
        assert_eq!(tier, StopTier::Graceful);

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).expect("calls");
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls, vec!["down", "up", "down"]);
    }

    #[test]
    fn test_teardown_stage_argv() {
        let strategy = ComposeStrategy::new(vec!["docker".to_string(), "compose".to_string()], 10);
        let spec = spec();
        let StartStrategy::Compose(stack) = &spec.strategy else {
            panic!("expected compose");
        };
        let stage = strategy.teardown_stage(&spec, stack);
        assert_eq!(
            stage.command,
            vec![
                "docker",
                "compose",
                "-p",
                "bc-test",
                "-f",
                "stack.yml",
                "down",
                "-v",
                "--remove-orphans"
            ]
        );
        assert_eq!(stage.timeout_secs, 5);
    }
}
