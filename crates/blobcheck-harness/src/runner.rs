//! Stage execution with timeout and output capture.

use crate::stage::StageConfig;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Why a stage could not produce an exit status.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("stage {0} has an empty command")]
    EmptyCommand(String),

    #[error("stage {stage}: failed to spawn {program}: {source}")]
    Spawn {
        stage: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stage {stage} timed out after {timeout_secs} seconds")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("stage {stage}: {source}")]
    Io {
        stage: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result of a stage execution.
#[derive(Debug, Clone)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,

    /// Exit code; `None` when the process died from a signal.
    pub exit_code: Option<i32>,

    /// Terminating signal, if any.
    pub signal: Option<i32>,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl StageResult {
    /// Whether this stage passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs stages as child processes.
pub struct StageRunner;

impl StageRunner {
    /// Execute a single stage and return its result.
    ///
    /// The child is killed when the timeout expires, so a hung runner never
    /// outlives its bound.
    pub async fn execute_stage(config: &StageConfig) -> Result<StageResult, StageError> {
        let start = Instant::now();

        let Some((exe, args)) = config.command.split_first() else {
            return Err(StageError::EmptyCommand(config.name.clone()));
        };

        let mut command = Command::new(exe);
        command
            .args(args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        debug!(stage = %config.name, program = %exe, "spawning stage");
        let child = command.spawn().map_err(|source| StageError::Spawn {
            stage: config.name.clone(),
            program: exe.clone(),
            source,
        })?;

        let output = if config.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(config.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| StageError::Timeout {
                stage: config.name.clone(),
                timeout_secs: config.timeout_secs,
            })?
        } else {
            child.wait_with_output().await
        }
        .map_err(|source| StageError::Io {
            stage: config.name.clone(),
            source,
        })?;

        Ok(StageResult {
            stage_name: config.name.clone(),
            exit_code: output.status.code(),
            signal: output.status.signal(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str, timeout_secs: u64) -> StageConfig {
        StageConfig::new(
            name,
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs,
        )
    }

    #[test]
    fn test_stage_result_passed() {
        let result = StageResult {
            stage_name: "runner".to_string(),
            exit_code: Some(0),
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 100,
        };
        assert!(result.passed());
    }

    #[test]
    fn test_stage_result_signalled_is_not_passed() {
        let result = StageResult {
            stage_name: "runner".to_string(),
            exit_code: None,
            signal: Some(9),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 100,
        };
        assert!(!result.passed());
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let config = StageConfig::new(
            "echo_test",
            vec!["echo".to_string(), "hello".to_string()],
            60,
        );

        let result = StageRunner::execute_stage(&config)
            .await
            .expect("execute failed");
        assert!(result.passed());
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let result = StageRunner::execute_stage(&sh("exit_three", "exit 3", 60))
            .await
            .expect("execute failed");
        assert!(!result.passed());
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_env_is_injected() {
        let config = sh("env", "printf %s \"$BLOBCHECK_TARGET\"", 60)
            .with_env([("BLOBCHECK_TARGET", "reference")]);
        let result = StageRunner::execute_stage(&config)
            .await
            .expect("execute failed");
        assert_eq!(result.stdout, "reference");
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let err = StageRunner::execute_stage(&sh("sleepy", "sleep 5", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let config = StageConfig::new(
            "missing",
            vec!["/nonexistent/blobcheck-runner".to_string()],
            5,
        );
        let err = StageRunner::execute_stage(&config).await.unwrap_err();
        assert!(matches!(err, StageError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let config = StageConfig::new("empty", vec![], 5);
        let err = StageRunner::execute_stage(&config).await.unwrap_err();
        assert!(matches!(err, StageError::EmptyCommand(_)));
    }
}
