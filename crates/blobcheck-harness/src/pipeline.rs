//! Sequential conformance pipeline.
//!
//! For each selected target, strictly one at a time:
//! start → probe → run gated suite → extract → emit → stop.
//!
//! A target's stop sequence always completes before the next target starts.
//! Per-target errors are recorded in the [`RunSummary`] and the run moves
//! on; only configuration and self-check failures abort the whole run.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use blobcheck_core::obs;
use blobcheck_core::reporter::BUNDLE_FILE;
use blobcheck_core::{
    annotate_records, parse_file, CatalogEntry, GatePlan, HarnessError, HarnessResult,
    RecordSummary, ReportEmitter, ReportSink, RootConfig, RunId, RunManifest, TargetReport,
    TargetSpec,
};
use futures::FutureExt;
use serde::Serialize;
use tracing::{info, warn, Instrument};

use crate::adapter::{ExecutionRequest, ExitClass, TestExecutionAdapter};
use crate::lifecycle::{Controller, StartedTarget};
use crate::runtime::RuntimeEnv;
use crate::selfcheck::SelfCheck;

/// Per-target captured output file.
pub const TARGET_LOG_FILE: &str = "target.log";

/// A target that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub target: String,
    /// Error class, e.g. `startup` or `execution`.
    pub class: String,
    pub cause: String,
}

/// Outcome of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub configured: usize,
    pub completed: usize,
    pub failures: Vec<TargetFailure>,
    pub manifest_path: Option<PathBuf>,
    pub duration_ms: u64,
}

impl RunSummary {
    /// Every configured target completed.
    pub fn success(&self) -> bool {
        self.failures.is_empty() && self.completed == self.configured
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "run {}: {}/{} target(s) completed in {}ms",
            self.run_id, self.completed, self.configured, self.duration_ms
        )?;
        for failure in &self.failures {
            writeln!(
                f,
                "  FAILED {} [{}]: {}",
                failure.target, failure.class, failure.cause
            )?;
        }
        if let Some(path) = &self.manifest_path {
            writeln!(f, "manifest: {}", path.display())?;
        }
        Ok(())
    }
}

/// Drives targets through the lifecycle, one at a time.
pub struct ConformancePipeline {
    controller: Controller,
    adapter: TestExecutionAdapter,
    emitter: ReportEmitter,
    sink: Arc<dyn ReportSink>,
    catalog: Vec<CatalogEntry>,
    self_check: SelfCheck,
}

impl ConformancePipeline {
    pub fn from_config(config: &RootConfig, env: RuntimeEnv) -> HarnessResult<Self> {
        config.validate_bounds()?;
        let emitter = ReportEmitter::new(config.artifacts_dir.clone());
        Ok(Self {
            controller: Controller::new(env, config.log_buffer_capacity)?,
            adapter: TestExecutionAdapter::new(config.runner.clone()),
            sink: Arc::new(emitter.clone()),
            emitter,
            catalog: config.catalog.clone(),
            self_check: SelfCheck::new(config.self_check.clone()),
        })
    }

    /// Send per-target reports to `sink` instead of the artifacts tree.
    ///
    /// Raw runner output, `target.log` and the manifest still land under the
    /// configured artifacts directory.
    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Run every target in order.
    ///
    /// Returns `Err` only when nothing was started: invalid target
    /// descriptors or a failed self-check.
    pub async fn run(&self, targets: &[&TargetSpec]) -> HarnessResult<RunSummary> {
        for spec in targets {
            spec.validate()?;
        }
        self.self_check.run().await?;

        let start = Instant::now();
        let run_id = RunId::generate();
        let mut manifest = RunManifest::new(run_id.clone());
        let mut failures = Vec::new();
        obs::emit_run_started(run_id.as_str(), targets.len());

        for spec in targets {
            let span = obs::target_span(run_id.as_str(), &spec.name);
            match self.run_target(&run_id, spec).instrument(span).await {
                Ok(bundle) => manifest.append(&spec.name, bundle),
                Err(e) => {
                    obs::emit_target_failed(&spec.name, e.class(), &e.to_string());
                    failures.push(TargetFailure {
                        target: spec.name.clone(),
                        class: e.class().to_string(),
                        cause: e.to_string(),
                    });
                }
            }
        }

        let manifest_path = match manifest.persist(self.emitter.root()) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "failed to write run manifest");
                None
            }
        };

        let summary = RunSummary {
            run_id,
            configured: targets.len(),
            completed: manifest.targets.len(),
            failures,
            manifest_path,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        obs::emit_run_finished(
            summary.run_id.as_str(),
            summary.configured,
            summary.completed,
            summary.duration_ms,
        );
        Ok(summary)
    }

    /// Start, exercise and stop one target; returns the bundle's relative
    /// path.
    async fn run_target(&self, run_id: &RunId, spec: &TargetSpec) -> HarnessResult<PathBuf> {
        let dir = self.emitter.target_dir(&spec.name);
        remove_if_present(&dir.join(BUNDLE_FILE))?;

        let mut started = self.controller.start(spec).await?;
        started.mark_running();

        let exercised = AssertUnwindSafe(self.exercise(run_id, spec, &started, &dir))
            .catch_unwind()
            .await;

        started.stop().await;
        if let Err(e) = write_target_log(&dir, &started) {
            warn!(target_name = %spec.name, error = %e, "failed to write target log");
        }

        match exercised {
            Ok(result) => result,
            Err(panic) => Err(HarnessError::execution(
                &spec.name,
                format!("panicked: {}", panic_message(panic.as_ref())),
            )),
        }
    }

    async fn exercise(
        &self,
        run_id: &RunId,
        spec: &TargetSpec,
        started: &StartedTarget,
        dir: &Path,
    ) -> HarnessResult<PathBuf> {
        let plan = GatePlan::evaluate(&self.catalog, &started.capabilities);
        if !plan.gated.is_empty() {
            info!(
                target_name = %spec.name,
                enabled = plan.enabled.len(),
                gated = plan.gated.len(),
                "capability gate applied"
            );
        }

        let request = ExecutionRequest::for_target(started, &plan);
        let outcome = self.adapter.run(&request, dir).await?;
        if let ExitClass::Crash { reason } = &outcome.class {
            return Err(HarnessError::execution(&spec.name, reason));
        }

        let (records, extraction_error) = match parse_file(&outcome.raw_output) {
            Ok(records) => (records, None),
            Err(e) => {
                warn!(target_name = %spec.name, error = %e, "extraction degraded to an empty result");
                (Vec::new(), Some(e.to_string()))
            }
        };
        let records = annotate_records(records, &self.catalog, &plan);
        let summary = RecordSummary::from_records(&records);

        let bundle = self.sink.emit(TargetReport {
            run_id,
            spec,
            base_url: &started.base_url,
            records,
            raw_output: outcome
                .raw_output
                .exists()
                .then_some(outcome.raw_output.as_path()),
            extraction_error,
        })?;
        obs::emit_target_completed(&spec.name, summary.passed, summary.failed, summary.skipped);
        Ok(bundle)
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn write_target_log(dir: &Path, started: &StartedTarget) -> HarnessResult<()> {
    std::fs::create_dir_all(dir)?;
    let meta = &started.metadata;
    let mut text = format!(
        "target: {}\nstrategy: {}\nstarted_at: {}\nstartup_ms: {}\n",
        started.name,
        meta.strategy,
        meta.started_at.to_rfc3339(),
        meta.startup_ms
    );
    for (key, value) in &meta.identifiers {
        text.push_str(&format!("{key}: {value}\n"));
    }
    text.push_str("---\n");
    match started.logs() {
        Some(logs) => text.push_str(&logs),
        None => text.push_str("(output not captured by this strategy)\n"),
    }
    std::fs::write(dir.join(TARGET_LOG_FILE), text)?;
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_success_and_display() {
        let mut summary = RunSummary {
            run_id: RunId::from_string("20261018T120000000Z"),
            configured: 2,
            completed: 2,
            failures: Vec::new(),
            manifest_path: Some(PathBuf::from("artifacts/manifest.json")),
            duration_ms: 10,
        };
        assert!(summary.success());

        summary.completed = 1;
        summary.failures.push(TargetFailure {
            target: "stack".to_string(),
            class: "startup".to_string(),
            cause: "readiness timeout".to_string(),
        });
        assert!(!summary.success());
        let text = summary.to_string();
        assert!(text.contains("1/2 target(s) completed"));
        assert!(text.contains("FAILED stack [startup]: readiness timeout"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
