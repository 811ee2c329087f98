//! Bounded subprocess invocations.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A named command run to completion under a timeout.
///
/// Used for the test runner, the self-check command and compose teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Human-readable stage name.
    pub name: String,

    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,

    /// Working directory; inherits the harness's when unset.
    pub cwd: Option<PathBuf>,

    /// Timeout in seconds (0 = unbounded).
    pub timeout_secs: u64,
}

impl StageConfig {
    pub fn new(name: impl Into<String>, command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            command,
            env: BTreeMap::new(),
            cwd: None,
            timeout_secs,
        }
    }

    /// Add environment variables, overriding earlier values.
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}
