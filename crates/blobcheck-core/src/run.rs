//! Run identity and the run-level manifest.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HarnessResult;

/// Last issued run id, in epoch milliseconds.
static LAST_RUN_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Timestamp-derived run identifier, strictly increasing within a process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Issue a new run id from the current time.
    pub fn generate() -> Self {
        Self::generate_at(Utc::now())
    }

    /// Issue a run id no earlier than `now`, bumped past the last issued one.
    pub fn generate_at(now: DateTime<Utc>) -> Self {
        let wanted = now.timestamp_millis();
        let mut prev = LAST_RUN_MILLIS.load(Ordering::SeqCst);
        let issued = loop {
            let next = wanted.max(prev + 1);
            match LAST_RUN_MILLIS.compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break next,
                Err(actual) => prev = actual,
            }
        };
        let ts = Utc
            .timestamp_millis_opt(issued)
            .single()
            .unwrap_or(now);
        RunId(ts.format("%Y%m%dT%H%M%S%.3fZ").to_string().replace('.', ""))
    }

    /// Wrap an existing id (e.g. when re-emitting a previous run).
    pub fn from_string(id: impl Into<String>) -> Self {
        RunId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One completed target in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub target: String,
    /// Bundle path relative to the artifacts root.
    pub bundle: PathBuf,
}

/// Run-level index of completed targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub targets: Vec<ManifestEntry>,
}

impl RunManifest {
    pub fn new(run_id: RunId) -> Self {
        Self::new_at(run_id, Utc::now())
    }

    pub fn new_at(run_id: RunId, created_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            created_at,
            targets: Vec::new(),
        }
    }

    /// Record a completed target. A target already present is replaced.
    pub fn append(&mut self, target: impl Into<String>, bundle: impl Into<PathBuf>) {
        let target = target.into();
        let bundle = bundle.into();
        match self.targets.iter_mut().find(|e| e.target == target) {
            Some(entry) => entry.bundle = bundle,
            None => self.targets.push(ManifestEntry { target, bundle }),
        }
    }

    /// Write `manifest.json` under `root`, creating it if needed.
    pub fn persist(&self, root: &Path) -> HarnessResult<PathBuf> {
        let path = root.join(crate::reporter::MANIFEST_FILE);
        crate::reporter::write_json(&path, self)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_strictly_increase() {
        let now = Utc::now();
        let a = RunId::generate_at(now);
        let b = RunId::generate_at(now);
        let c = RunId::generate();
        assert!(a < b, "{a} < {b}");
        assert!(b < c, "{b} < {c}");
    }

    #[test]
    fn test_run_id_shape() {
        let id = RunId::generate();
        assert!(id.as_str().ends_with('Z'));
        assert!(id.as_str().contains('T'));
        assert!(!id.as_str().contains('.'));
    }

    #[test]
    fn test_manifest_append_replaces_existing_target() {
        let mut manifest = RunManifest::new(RunId::from_string("run-1"));
        manifest.append("a", "a/results.json");
        manifest.append("b", "b/results.json");
        manifest.append("a", "a/results-v2.json");
        assert_eq!(manifest.targets.len(), 2);
        assert_eq!(manifest.targets[0].bundle, PathBuf::from("a/results-v2.json"));
    }

    #[test]
    fn test_manifest_persist_creates_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("nested/artifacts");
        let mut manifest = RunManifest::new(RunId::from_string("run-1"));
        manifest.append("a", "a/results.json");
        let path = manifest.persist(&root).expect("persist");
        let raw = std::fs::read_to_string(path).expect("read");
        assert!(raw.ends_with("}\n"));
        let back: RunManifest = serde_json::from_str(&raw).expect("parse");
        assert_eq!(back, manifest);
    }
}
