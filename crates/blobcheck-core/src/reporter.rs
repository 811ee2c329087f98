//! Per-target report artifacts.
//!
//! For each completed target the emitter writes, under `<root>/<target>/`:
//! - `results.json`: machine-readable result bundle (summary + records)
//! - `coverage.json` / `coverage.md`: capability coverage table
//! - `server.json`: declared capabilities, limits and start strategy
//!
//! Output is a pure function of the inputs, so re-emitting overwrites with
//! byte-identical content.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::capability::{Capability, CapabilitySet};
use crate::config::{ResourceLimits, StartStrategy, TargetSpec};
use crate::error::HarnessResult;
use crate::record::{RecordSummary, TestRecord, TestStatus};
use crate::run::RunId;

pub const BUNDLE_FILE: &str = "results.json";
pub const COVERAGE_JSON_FILE: &str = "coverage.json";
pub const COVERAGE_MD_FILE: &str = "coverage.md";
pub const SERVER_FILE: &str = "server.json";
pub const MANIFEST_FILE: &str = "manifest.json";

// ── coverage table ────────────────────────────────────────────────────────

/// One capability referenced by at least one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRow {
    pub capability: Capability,
    pub extension: bool,
    pub supported: bool,
    /// Tests requiring this capability.
    pub tests: usize,
    /// Of those, how many passed.
    pub passed: usize,
}

/// Capability coverage for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageTable {
    pub target: String,
    pub rows: Vec<CoverageRow>,
}

impl CoverageTable {
    /// Key the table by every capability any record requires.
    pub fn build(target: &str, declared: &CapabilitySet, records: &[TestRecord]) -> Self {
        let mut rows: BTreeMap<&Capability, CoverageRow> = BTreeMap::new();
        for record in records {
            for cap in record.requires.tokens() {
                let row = rows.entry(cap).or_insert_with(|| CoverageRow {
                    capability: cap.clone(),
                    extension: cap.is_extension(),
                    supported: declared.contains(cap),
                    tests: 0,
                    passed: 0,
                });
                row.tests += 1;
                if record.status == TestStatus::Passed {
                    row.passed += 1;
                }
            }
        }
        Self {
            target: target.to_string(),
            rows: rows.into_values().collect(),
        }
    }

    /// Render as a Markdown table, core capabilities before extensions.
    pub fn render_markdown(&self) -> String {
        let mut md = format!("# Capability coverage: {}\n", self.target);
        if self.rows.is_empty() {
            md.push_str("\nNo test declared a capability requirement.\n");
            return md;
        }
        md.push_str("\n| Capability | Supported | Tests | Passed |\n");
        md.push_str("|---|---|---|---|\n");
        let (core, ext): (Vec<&CoverageRow>, Vec<&CoverageRow>) =
            self.rows.iter().partition(|r| !r.extension);
        for row in core.into_iter().chain(ext) {
            md.push_str(&format!(
                "| `{}` | {} | {} | {} |\n",
                row.capability,
                if row.supported { "yes" } else { "no" },
                row.tests,
                row.passed
            ));
        }
        md
    }
}

// ── results.json ──────────────────────────────────────────────────────────

/// Canonical per-target result bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultBundle {
    pub run_id: RunId,
    pub target: String,
    pub base_url: String,
    pub capabilities: CapabilitySet,
    pub summary: RecordSummary,
    /// SHA-256 of the raw runner output, when it existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output_sha256: Option<String>,
    /// Why extraction degraded, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_error: Option<String>,
    pub records: Vec<TestRecord>,
}

// ── server.json ───────────────────────────────────────────────────────────

/// What the target claimed about itself. Secrets are never included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMetadata {
    pub target: String,
    pub capabilities: CapabilitySet,
    pub limits: ResourceLimits,
    pub strategy: StartStrategy,
}

impl ServerMetadata {
    pub fn from_spec(spec: &TargetSpec) -> Self {
        Self {
            target: spec.name.clone(),
            capabilities: spec.capabilities.clone(),
            limits: spec.limits.clone(),
            strategy: spec.strategy.clone(),
        }
    }
}

// ── emitter ───────────────────────────────────────────────────────────────

/// Inputs for one target's artifacts.
pub struct TargetReport<'a> {
    pub run_id: &'a RunId,
    pub spec: &'a TargetSpec,
    pub base_url: &'a str,
    pub records: Vec<TestRecord>,
    pub raw_output: Option<&'a Path>,
    pub extraction_error: Option<String>,
}

/// Destination for one completed target's report.
///
/// [`ReportEmitter`] is the file-backed implementation; the pipeline accepts
/// any other sink in its place.
pub trait ReportSink: Send + Sync {
    /// Persist the report; returns the bundle path relative to the artifacts
    /// root, for the manifest.
    fn emit(&self, report: TargetReport<'_>) -> HarnessResult<PathBuf>;
}

/// Writes report artifacts under a fixed artifacts root.
#[derive(Debug, Clone)]
pub struct ReportEmitter {
    root: PathBuf,
}

impl ReportEmitter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by one target.
    pub fn target_dir(&self, target: &str) -> PathBuf {
        self.root.join(target)
    }

    /// Emit all per-target artifacts; returns the bundle path relative to
    /// the artifacts root, for the manifest.
    pub fn emit(&self, report: TargetReport<'_>) -> HarnessResult<PathBuf> {
        let target = report.spec.name.as_str();
        let dir = self.target_dir(target);
        std::fs::create_dir_all(&dir)?;

        let raw_output_sha256 = report.raw_output.and_then(file_sha256);
        let coverage = CoverageTable::build(target, &report.spec.capabilities, &report.records);
        let bundle = ResultBundle {
            run_id: report.run_id.clone(),
            target: target.to_string(),
            base_url: report.base_url.to_string(),
            capabilities: report.spec.capabilities.clone(),
            summary: RecordSummary::from_records(&report.records),
            raw_output_sha256,
            extraction_error: report.extraction_error,
            records: report.records,
        };

        write_json(&dir.join(BUNDLE_FILE), &bundle)?;
        write_json(&dir.join(COVERAGE_JSON_FILE), &coverage)?;
        std::fs::write(dir.join(COVERAGE_MD_FILE), coverage.render_markdown())?;
        write_json(
            &dir.join(SERVER_FILE),
            &ServerMetadata::from_spec(report.spec),
        )?;

        Ok(PathBuf::from(target).join(BUNDLE_FILE))
    }
}

impl ReportSink for ReportEmitter {
    fn emit(&self, report: TargetReport<'_>) -> HarnessResult<PathBuf> {
        ReportEmitter::emit(self, report)
    }
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> HarnessResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');
    std::fs::write(path, json)?;
    Ok(())
}

fn file_sha256(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(hex::encode(hasher.finalize()))
}
