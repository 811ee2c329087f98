//! Target descriptors and root configuration.
//!
//! The configuration is loaded once from TOML and treated as immutable for
//! the rest of the run. Each target picks exactly one start strategy:
//!
//! ```toml
//! default_target = "reference"
//!
//! [targets.reference]
//! strategy = "container"
//! image = "ghcr.io/example/blob-server:latest"
//! ports = [3000]
//! base_url = "http://127.0.0.1:{0}"
//! capabilities = ["core:health", "core:upload", "core:download"]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::capability::{CapabilitySet, CatalogEntry};
use crate::error::{HarnessError, HarnessResult};

/// Default capacity of the per-target log ring buffer, in lines.
pub const DEFAULT_LOG_BUFFER_CAPACITY: usize = 2_000;

// ---------------------------------------------------------------------------
// Target descriptor
// ---------------------------------------------------------------------------

/// Everything needed to start, probe and describe one target.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSpec {
    /// Target name; filled from the table key when loaded from a root config.
    #[serde(default)]
    pub name: String,

    /// Base URL template with positional port placeholders (`{0}`, `{1}`).
    pub base_url: String,

    /// Declared capability tokens.
    #[serde(default)]
    pub capabilities: CapabilitySet,

    /// Readiness probe.
    #[serde(default)]
    pub probe: ProbeSpec,

    /// Resource limits applied where the strategy supports them.
    #[serde(default)]
    pub limits: ResourceLimits,

    /// Secrets injected into the target's environment. Never written out.
    #[serde(default)]
    pub secrets: SecretBag,

    /// How the target is started.
    #[serde(flatten)]
    pub strategy: StartStrategy,
}

impl TargetSpec {
    /// Substitute the given ports into the base URL template.
    pub fn resolve_base_url(&self, ports: &[u16]) -> HarnessResult<String> {
        resolve_template(&self.base_url, ports)
    }

    /// Check that every placeholder in the base URL and, for local commands,
    /// in the argv has a declared port, before anything is started.
    pub fn validate(&self) -> HarnessResult<()> {
        let placeholder_ports = vec![0u16; self.strategy.ports().len()];
        let argv: &[String] = match &self.strategy {
            StartStrategy::Command(cmd) => &cmd.command,
            _ => &[],
        };
        std::iter::once(&self.base_url)
            .chain(argv)
            .try_for_each(|template| resolve_template(template, &placeholder_ports).map(|_| ()))
            .map_err(|e| HarnessError::Configuration(format!("target {}: {e}", self.name)))
    }
}

/// Start-strategy variants. Resolved once per target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StartStrategy {
    Container(ContainerSpec),
    Compose(ComposeSpec),
    Command(CommandSpec),
}

impl StartStrategy {
    pub fn kind(&self) -> &'static str {
        match self {
            StartStrategy::Container(_) => "container",
            StartStrategy::Compose(_) => "compose",
            StartStrategy::Command(_) => "command",
        }
    }

    /// Declared ports, in placeholder order.
    pub fn ports(&self) -> &[u16] {
        match self {
            StartStrategy::Container(c) => &c.ports,
            StartStrategy::Compose(c) => &c.ports,
            StartStrategy::Command(c) => &c.ports,
        }
    }
}

/// Single container started from an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,

    /// Container ports, each published to an ephemeral host port.
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Container paths backed by ephemeral writable volumes.
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Non-secret environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Extra arguments passed after the image name.
    #[serde(default)]
    pub args: Vec<String>,

    /// Bound on the graceful stop tier.
    #[serde(default = "default_container_stop_secs")]
    pub stop_timeout_secs: u64,

    /// Bound on the forced removal tier.
    #[serde(default = "default_container_remove_secs")]
    pub remove_timeout_secs: u64,
}

/// Multi-process stack driven by a compose file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeSpec {
    pub file: PathBuf,

    /// Project identifier; stale stacks with the same id are torn down first.
    pub project: String,

    /// Host ports the stack publishes, in placeholder order.
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Grace window between the termination and kill signals.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    /// Bound on the teardown command.
    #[serde(default = "default_teardown_secs")]
    pub teardown_timeout_secs: u64,
}

/// Local process spawned directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Argv; the first element is the executable.
    pub command: Vec<String>,

    #[serde(default)]
    pub cwd: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Ports in placeholder order; `0` allocates a free ephemeral port which
    /// is exported to the process as `BLOBCHECK_PORT_<index>`.
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Grace window between the termination and kill signals.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

/// Readiness probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    #[serde(default = "default_probe_path")]
    pub path: String,

    #[serde(default = "default_probe_status")]
    pub expected_status: u16,

    /// Overall budget.
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,

    /// Delay between attempts.
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,

    /// Upper bound for a single attempt; always clamped below `timeout_ms`.
    #[serde(default = "default_probe_attempt_ms")]
    pub attempt_timeout_ms: u64,
}

impl Default for ProbeSpec {
    fn default() -> Self {
        Self {
            path: default_probe_path(),
            expected_status: default_probe_status(),
            timeout_ms: default_probe_timeout_ms(),
            interval_ms: default_probe_interval_ms(),
            attempt_timeout_ms: default_probe_attempt_ms(),
        }
    }
}

impl ProbeSpec {
    /// Join the probe path onto a resolved base URL.
    pub fn url_for(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        if self.path.is_empty() {
            return base.to_string();
        }
        if self.path.starts_with('/') {
            format!("{}{}", base, self.path)
        } else {
            format!("{}/{}", base, self.path)
        }
    }
}

/// Resource limits; unset fields mean "strategy default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub memory_mb: Option<u64>,

    #[serde(default)]
    pub cpus: Option<f64>,

    #[serde(default)]
    pub pids: Option<u64>,
}

/// Secret environment values. `Debug` prints key names only.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretBag(BTreeMap<String, String>);

impl SecretBag {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        SecretBag(values)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

// ---------------------------------------------------------------------------
// Root configuration
// ---------------------------------------------------------------------------

/// Test runner invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Argv with `{raw_output}` and `{target}` placeholders.
    #[serde(default = "default_runner_command")]
    pub command: Vec<String>,

    /// Write the runner's stdout into the raw output file.
    #[serde(default = "default_true")]
    pub capture_stdout: bool,

    #[serde(default = "default_runner_timeout_secs")]
    pub timeout_secs: u64,

    /// Exit codes meaning "ran, some tests failed".
    #[serde(default = "default_failure_exit_codes")]
    pub failure_exit_codes: Vec<i32>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: default_runner_command(),
            capture_stdout: true,
            timeout_secs: default_runner_timeout_secs(),
            failure_exit_codes: default_failure_exit_codes(),
            env: BTreeMap::new(),
        }
    }
}

/// Pre-flight self-check settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfCheckConfig {
    /// Extra command run after the built-in checks.
    #[serde(default)]
    pub command: Option<Vec<String>>,

    #[serde(default = "default_self_check_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SelfCheckConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_self_check_timeout_secs(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub default_target: Option<String>,

    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,

    #[serde(default = "default_log_buffer_capacity")]
    pub log_buffer_capacity: usize,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub self_check: SelfCheckConfig,

    #[serde(default)]
    pub catalog: Vec<CatalogEntry>,

    #[serde(default)]
    pub targets: BTreeMap<String, TargetSpec>,
}

impl RootConfig {
    /// Parse a TOML document and name each target after its table key.
    pub fn from_toml_str(raw: &str) -> HarnessResult<Self> {
        let mut config: RootConfig =
            toml::from_str(raw).map_err(|e| HarnessError::Configuration(e.to_string()))?;
        for (name, target) in config.targets.iter_mut() {
            target.name = name.clone();
        }
        config.validate_bounds()?;
        Ok(config)
    }

    /// Runner and self-check stages must carry a timeout.
    pub fn validate_bounds(&self) -> HarnessResult<()> {
        if self.runner.timeout_secs == 0 {
            return Err(HarnessError::Configuration(
                "runner.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.self_check.timeout_secs == 0 {
            return Err(HarnessError::Configuration(
                "self_check.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Targets to run, in order.
    ///
    /// Explicit names win; otherwise the default target; otherwise every
    /// target in name order.
    pub fn select(&self, names: &[String]) -> HarnessResult<Vec<&TargetSpec>> {
        if !names.is_empty() {
            return names.iter().map(|n| self.lookup(n)).collect();
        }
        if let Some(default) = &self.default_target {
            return Ok(vec![self.lookup(default)?]);
        }
        Ok(self.targets.values().collect())
    }

    fn lookup(&self, name: &str) -> HarnessResult<&TargetSpec> {
        self.targets
            .get(name)
            .ok_or_else(|| HarnessError::Configuration(format!("unknown target: {name}")))
    }
}

// ---------------------------------------------------------------------------
// Template substitution
// ---------------------------------------------------------------------------

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{(\d+)\}").expect("placeholder pattern is valid"))
}

/// Replace positional `{N}` placeholders with `ports[N]`.
///
/// A placeholder without a matching port is a configuration error.
pub fn resolve_template(template: &str, ports: &[u16]) -> HarnessResult<String> {
    let mut unresolved = Vec::new();
    let resolved = placeholder_re().replace_all(template, |caps: &regex::Captures<'_>| {
        let idx: Option<usize> = caps[1].parse().ok();
        match idx.and_then(|i| ports.get(i)) {
            Some(port) => port.to_string(),
            None => {
                unresolved.push(caps[0].to_string());
                caps[0].to_string()
            }
        }
    });
    if !unresolved.is_empty() {
        return Err(HarnessError::Configuration(format!(
            "unresolved placeholder(s) {} in template {template:?} ({} port(s) available)",
            unresolved.join(", "),
            ports.len()
        )));
    }
    Ok(resolved.into_owned())
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_container_stop_secs() -> u64 {
    10
}

fn default_container_remove_secs() -> u64 {
    10
}

fn default_grace_secs() -> u64 {
    5
}

fn default_teardown_secs() -> u64 {
    60
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_probe_status() -> u16 {
    200
}

fn default_probe_timeout_ms() -> u64 {
    30_000
}

fn default_probe_interval_ms() -> u64 {
    250
}

fn default_probe_attempt_ms() -> u64 {
    2_000
}

fn default_runner_command() -> Vec<String> {
    [
        "cargo",
        "test",
        "--test",
        "conformance",
        "--",
        "-Z",
        "unstable-options",
        "--format",
        "junit",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_runner_timeout_secs() -> u64 {
    1_800
}

fn default_failure_exit_codes() -> Vec<i32> {
    vec![1]
}

fn default_self_check_timeout_secs() -> u64 {
    300
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_log_buffer_capacity() -> usize {
    DEFAULT_LOG_BUFFER_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;

    const SAMPLE: &str = r#"
default_target = "reference"

[runner]
command = ["npx", "playwright", "test", "--reporter=junit"]
timeout_secs = 600

[[catalog]]
id = "upload::put_blob"
requires = ["core:upload"]

[targets.reference]
strategy = "container"
image = "ghcr.io/example/blob-server:1.2"
ports = [3000]
volumes = ["/data"]
base_url = "http://127.0.0.1:{0}"
capabilities = ["core:health", "core:upload"]

[targets.reference.probe]
path = "/health"
timeout_ms = 5000

[targets.reference.secrets]
ADMIN_TOKEN = "hunter2"

[targets.stack]
strategy = "compose"
file = "stacks/blob/docker-compose.yml"
project = "blobcheck-stack"
ports = [8080]
base_url = "http://localhost:{0}/"

[targets.local]
strategy = "command"
command = ["./target/release/blob-server", "--port", "0"]
ports = [0]
base_url = "http://127.0.0.1:{0}"
"#;

    #[test]
    fn test_parse_root_config() {
        let config = RootConfig::from_toml_str(SAMPLE).expect("parse");
        assert_eq!(config.default_target.as_deref(), Some("reference"));
        assert_eq!(config.targets.len(), 3);
        assert_eq!(config.runner.timeout_secs, 600);
        assert_eq!(config.runner.failure_exit_codes, vec![1]);
        assert_eq!(config.catalog.len(), 1);
        assert_eq!(config.log_buffer_capacity, DEFAULT_LOG_BUFFER_CAPACITY);

        let reference = &config.targets["reference"];
        assert_eq!(reference.name, "reference");
        assert_eq!(reference.probe.path, "/health");
        assert_eq!(reference.probe.expected_status, 200);
        assert!(reference
            .capabilities
            .contains(&Capability::from("core:upload")));
        match &reference.strategy {
            StartStrategy::Container(c) => {
                assert_eq!(c.ports, vec![3000]);
                assert_eq!(c.stop_timeout_secs, 10);
            }
            other => panic!("expected container strategy, got {:?}", other),
        }
        assert_eq!(config.targets["stack"].strategy.kind(), "compose");
        assert_eq!(config.targets["local"].strategy.kind(), "command");
    }

    #[test]
    fn test_secret_bag_debug_hides_values() {
        let config = RootConfig::from_toml_str(SAMPLE).expect("parse");
        let debug = format!("{:?}", config.targets["reference"].secrets);
        assert!(debug.contains("ADMIN_TOKEN"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_select_prefers_explicit_then_default() {
        let config = RootConfig::from_toml_str(SAMPLE).expect("parse");

        let picked = config.select(&["local".to_string()]).expect("select");
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "local");

        let picked = config.select(&[]).expect("select");
        assert_eq!(picked[0].name, "reference");
    }

    #[test]
    fn test_select_unknown_target_is_configuration_error() {
        let config = RootConfig::from_toml_str(SAMPLE).expect("parse");
        let err = config.select(&["nope".to_string()]).unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn test_select_all_without_default() {
        let mut config = RootConfig::from_toml_str(SAMPLE).expect("parse");
        config.default_target = None;
        let names: Vec<&str> = config
            .select(&[])
            .expect("select")
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["local", "reference", "stack"]);
    }

    #[test]
    fn test_resolve_template_positional() {
        let url = resolve_template("http://127.0.0.1:{0}/api?admin={1}", &[32768, 32769])
            .expect("resolve");
        assert_eq!(url, "http://127.0.0.1:32768/api?admin=32769");
    }

    #[test]
    fn test_resolve_template_missing_port() {
        let err = resolve_template("http://127.0.0.1:{1}", &[3000]).unwrap_err();
        assert!(err.to_string().contains("{1}"));
    }

    #[test]
    fn test_validate_rejects_placeholder_without_port() {
        let mut config = RootConfig::from_toml_str(SAMPLE).expect("parse");
        assert!(config.targets["reference"].validate().is_ok());

        let target = config.targets.get_mut("local").expect("local");
        target.base_url = "http://127.0.0.1:{0}/admin/{1}".to_string();
        let err = target.validate().unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
        assert!(err.to_string().contains("target local"));
    }

    #[test]
    fn test_probe_url_join() {
        let probe = ProbeSpec {
            path: "/health".to_string(),
            ..ProbeSpec::default()
        };
        assert_eq!(
            probe.url_for("http://localhost:8080/"),
            "http://localhost:8080/health"
        );
        let probe = ProbeSpec {
            path: "status".to_string(),
            ..ProbeSpec::default()
        };
        assert_eq!(
            probe.url_for("http://localhost:8080"),
            "http://localhost:8080/status"
        );
    }

    #[test]
    fn test_validate_rejects_argv_placeholder_without_port() {
        let mut config = RootConfig::from_toml_str(SAMPLE).expect("parse");
        let target = config.targets.get_mut("local").expect("local");
        if let StartStrategy::Command(cmd) = &mut target.strategy {
            cmd.command = vec!["blob-server".into(), "--port".into(), "{0}".into()];
        }
        assert!(target.validate().is_ok());

        if let StartStrategy::Command(cmd) = &mut target.strategy {
            cmd.command.push("--admin-port={5}".into());
        }
        let err = target.validate().unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
        assert!(err.to_string().contains("{5}"));
    }

    #[test]
    fn test_zero_stage_timeouts_are_rejected() {
        let runner = RootConfig::from_toml_str("[runner]\ntimeout_secs = 0\n").unwrap_err();
        assert!(runner.to_string().contains("runner.timeout_secs"));

        let self_check =
            RootConfig::from_toml_str("[self_check]\ntimeout_secs = 0\n").unwrap_err();
        assert!(self_check.to_string().contains("self_check.timeout_secs"));

        assert!(RootConfig::from_toml_str("[runner]\ntimeout_secs = 1\n").is_ok());
    }

    #[test]
    fn test_malformed_toml_is_configuration_error() {
        let err = RootConfig::from_toml_str("targets = [").unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }
}
