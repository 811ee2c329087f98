//! Test execution adapter.
//!
//! Runs the conformance test runner as a bounded subprocess against one live
//! target and classifies how it exited. The runner learns where the target
//! lives from its environment:
//!
//! | variable                 | value                                  |
//! |--------------------------|----------------------------------------|
//! | `BLOBCHECK_BASE_URL`     | resolved base URL                      |
//! | `BLOBCHECK_TARGET`       | target name                            |
//! | `BLOBCHECK_RAW_OUTPUT`   | where raw structured output must go    |
//! | `BLOBCHECK_CAPABILITIES` | declared capability tokens             |
//! | `BLOBCHECK_GATED_TESTS`  | catalog ids that must not run          |

use std::path::{Path, PathBuf};

use blobcheck_core::{CapabilitySet, GatePlan, HarnessResult, RunnerConfig, CAPABILITIES_ENV};
use serde::Serialize;
use tracing::{info, warn};

use crate::lifecycle::StartedTarget;
use crate::runner::{StageResult, StageRunner};
use crate::stage::StageConfig;

pub const BASE_URL_ENV: &str = "BLOBCHECK_BASE_URL";
pub const TARGET_ENV: &str = "BLOBCHECK_TARGET";
pub const RAW_OUTPUT_ENV: &str = "BLOBCHECK_RAW_OUTPUT";
pub const GATED_TESTS_ENV: &str = "BLOBCHECK_GATED_TESTS";

/// Subdirectory of a target's artifacts holding runner output.
pub const RAW_DIR: &str = "raw";
pub const RAW_OUTPUT_FILE: &str = "junit.xml";
pub const RUNNER_LOG_FILE: &str = "runner.log";

/// How the runner exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum ExitClass {
    /// All executed tests passed.
    Pass,
    /// The runner finished and reported failing tests.
    PassWithFailures,
    /// The runner could not be trusted to have produced results.
    Crash { reason: String },
}

impl ExitClass {
    pub fn classify(exit_code: Option<i32>, signal: Option<i32>, failure_codes: &[i32]) -> Self {
        match (exit_code, signal) {
            (Some(0), _) => ExitClass::Pass,
            (Some(code), _) if failure_codes.contains(&code) => ExitClass::PassWithFailures,
            (Some(code), _) => ExitClass::Crash {
                reason: format!("runner exited with unexpected code {code}"),
            },
            (None, Some(sig)) => ExitClass::Crash {
                reason: format!("runner killed by signal {sig}"),
            },
            (None, None) => ExitClass::Crash {
                reason: "runner exited without a status".to_string(),
            },
        }
    }

    /// Pass and pass-with-failures both go on to extraction.
    pub fn allows_extraction(&self) -> bool {
        !matches!(self, ExitClass::Crash { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitClass::Pass => "pass",
            ExitClass::PassWithFailures => "pass_with_failures",
            ExitClass::Crash { .. } => "crash",
        }
    }
}

/// What the runner needs to know about the live target.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub target: &'a str,
    pub base_url: &'a str,
    pub capabilities: &'a CapabilitySet,
    pub plan: &'a GatePlan,
}

impl<'a> ExecutionRequest<'a> {
    pub fn for_target(target: &'a StartedTarget, plan: &'a GatePlan) -> Self {
        Self {
            target: &target.name,
            base_url: &target.base_url,
            capabilities: &target.capabilities,
            plan,
        }
    }
}

/// Result of one runner invocation.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub class: ExitClass,
    /// Raw structured output path; may not exist after a crash.
    pub raw_output: PathBuf,
    pub runner_log: PathBuf,
    pub duration_ms: u64,
}

/// Runs the configured test runner.
#[derive(Debug, Clone)]
pub struct TestExecutionAdapter {
    config: RunnerConfig,
}

impl TestExecutionAdapter {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Build the runner stage for one target.
    pub fn stage(&self, request: &ExecutionRequest<'_>, raw_output: &Path) -> StageConfig {
        let raw = raw_output.display().to_string();
        let argv = self
            .config
            .command
            .iter()
            .map(|arg| {
                arg.replace("{raw_output}", &raw)
                    .replace("{target}", request.target)
            })
            .collect();

        StageConfig::new(
            format!("test-runner:{}", request.target),
            argv,
            self.config.timeout_secs,
        )
        .with_env(self.config.env.clone())
        .with_env([
            (BASE_URL_ENV.to_string(), request.base_url.to_string()),
            (TARGET_ENV.to_string(), request.target.to_string()),
            (RAW_OUTPUT_ENV.to_string(), raw),
            (
                CAPABILITIES_ENV.to_string(),
                request.capabilities.to_env_value(),
            ),
            (GATED_TESTS_ENV.to_string(), request.plan.gated_env_value()),
        ])
    }

    /// Run the suite against a live target, writing raw output under
    /// `<target_dir>/raw/`.
    ///
    /// Runner failures of any kind come back as [`ExitClass::Crash`]; only
    /// artifact I/O errors are returned as `Err`.
    pub async fn run(
        &self,
        request: &ExecutionRequest<'_>,
        target_dir: &Path,
    ) -> HarnessResult<ExecutionOutcome> {
        let raw_dir = target_dir.join(RAW_DIR);
        std::fs::create_dir_all(&raw_dir)?;
        let raw_output = raw_dir.join(RAW_OUTPUT_FILE);
        let runner_log = raw_dir.join(RUNNER_LOG_FILE);
        remove_stale(&raw_output)?;

        let stage = self.stage(request, &raw_output);
        info!(
            target_name = %request.target,
            command = %stage.command.join(" "),
            gated = request.plan.gated.len(),
            "running test suite"
        );

        let (class, duration_ms) = match StageRunner::execute_stage(&stage).await {
            Ok(result) => {
                let class = ExitClass::classify(
                    result.exit_code,
                    result.signal,
                    &self.config.failure_exit_codes,
                );
                if self.config.capture_stdout {
                    std::fs::write(&raw_output, &result.stdout)?;
                }
                std::fs::write(&runner_log, self.render_log(&stage, &class, Some(&result)))?;
                (class, result.duration_ms)
            }
            Err(e) => {
                let class = ExitClass::Crash {
                    reason: e.to_string(),
                };
                std::fs::write(&runner_log, self.render_log(&stage, &class, None))?;
                (class, 0)
            }
        };

        match &class {
            ExitClass::Crash { reason } => {
                warn!(target_name = %request.target, reason = %reason, "test runner crashed")
            }
            other => {
                info!(target_name = %request.target, class = other.as_str(), duration_ms, "test runner finished")
            }
        }

        Ok(ExecutionOutcome {
            class,
            raw_output,
            runner_log,
            duration_ms,
        })
    }

    fn render_log(&self, stage: &StageConfig, class: &ExitClass, result: Option<&StageResult>) -> String {
        let mut log = format!("command: {}\nclass: {}\n", stage.command.join(" "), class.as_str());
        if let ExitClass::Crash { reason } = class {
            log.push_str(&format!("reason: {reason}\n"));
        }
        if let Some(result) = result {
            log.push_str(&format!(
                "exit_code: {:?}\nsignal: {:?}\nduration_ms: {}\n",
                result.exit_code, result.signal, result.duration_ms
            ));
            if !self.config.capture_stdout {
                log.push_str("--- stdout ---\n");
                log.push_str(&result.stdout);
                if !result.stdout.ends_with('\n') {
                    log.push('\n');
                }
            }
            log.push_str("--- stderr ---\n");
            log.push_str(&result.stderr);
        }
        log
    }
}

fn remove_stale(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
