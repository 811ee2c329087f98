//! One-time resolution of the container runtime.
//!
//! Detection happens once at startup and the result is passed down by value;
//! strategies never probe the environment themselves.

use std::path::{Path, PathBuf};

use tracing::info;

/// Overrides the container CLI (`docker`, `podman`, or an absolute path).
pub const CONTAINER_CLI_ENV: &str = "BLOBCHECK_CONTAINER_CLI";

/// Overrides the compose invocation, whitespace separated.
pub const COMPOSE_CMD_ENV: &str = "BLOBCHECK_COMPOSE_CMD";

const CLI_CANDIDATES: &[&str] = &["docker", "podman"];

/// Resolved container tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnv {
    /// Container CLI program.
    pub container_cli: String,

    /// Compose argv prefix, e.g. `["docker", "compose"]`.
    pub compose: Vec<String>,
}

impl RuntimeEnv {
    pub fn new(container_cli: impl Into<String>, compose: Vec<String>) -> Self {
        Self {
            container_cli: container_cli.into(),
            compose,
        }
    }

    /// Resolve from the process environment and `PATH`.
    ///
    /// Falls back to `docker` when nothing is found so that the eventual
    /// failure surfaces as a per-target startup error.
    pub fn detect() -> Self {
        let path = std::env::var_os("PATH").unwrap_or_default();
        let dirs: Vec<PathBuf> = std::env::split_paths(&path).collect();
        let env = Self::resolve(
            std::env::var(CONTAINER_CLI_ENV).ok(),
            std::env::var(COMPOSE_CMD_ENV).ok(),
            &dirs,
        );
        info!(
            container_cli = %env.container_cli,
            compose = %env.compose.join(" "),
            "resolved container runtime"
        );
        env
    }

    fn resolve(cli_override: Option<String>, compose_override: Option<String>, dirs: &[PathBuf]) -> Self {
        let container_cli = cli_override
            .filter(|s| !s.trim().is_empty())
            .or_else(|| {
                CLI_CANDIDATES
                    .iter()
                    .find(|c| on_path(c, dirs))
                    .map(|c| c.to_string())
            })
            .unwrap_or_else(|| CLI_CANDIDATES[0].to_string());

        let compose = compose_override
            .map(|raw| raw.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|argv| !argv.is_empty())
            .unwrap_or_else(|| vec![container_cli.clone(), "compose".to_string()]);

        Self {
            container_cli,
            compose,
        }
    }
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self::new("docker", vec!["docker".to_string(), "compose".to_string()])
    }
}

fn on_path(program: &str, dirs: &[PathBuf]) -> bool {
    dirs.iter().any(|dir| is_file(&dir.join(program)))
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}
