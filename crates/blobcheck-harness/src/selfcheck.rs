//! Pre-flight self-check.
//!
//! Validates the harness's own machinery before any target is touched. The
//! first failing check aborts the whole run.

use std::time::Instant;

use blobcheck_core::{
    parse_str, requires, resolve_template, CapabilitySet, HarnessError, HarnessResult,
    SelfCheckConfig, TestStatus,
};
use tracing::{debug, info};

use crate::logbuf::{LogRing, LogStream};
use crate::runner::StageRunner;
use crate::stage::StageConfig;

type Check = fn() -> Result<(), String>;

/// Built-in checks, in execution order.
const BUILTIN_CHECKS: &[(&str, Check)] = &[
    ("predicate_algebra", check_predicate_algebra),
    ("extractor_fixture", check_extractor_fixture),
    ("url_template", check_url_template),
    ("log_ring_eviction", check_log_ring_eviction),
];

const FIXTURE: &str = r#"<testsuites>
  <testsuite name="selfcheck">
    <testcase name="ok" time="1.234"/>
    <testcase name="broken" time="0.5"><failure message="got &lt;script&gt;"><![CDATA[trace <raw>]]></failure><skipped/></testcase>
    <testcase name="gated" time="oops"><skipped message="missing capabilities: core:list"/></testcase>
    <testcase time="0.01"/>
  </testsuite>
"#;

/// Which checks ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfCheckReport {
    pub passed: Vec<String>,
    pub duration_ms: u64,
}

/// Runs the built-in checks and the optional configured command.
#[derive(Debug, Clone)]
pub struct SelfCheck {
    config: SelfCheckConfig,
}

impl SelfCheck {
    pub fn new(config: SelfCheckConfig) -> Self {
        Self { config }
    }

    /// Run every check, stopping at the first failure.
    pub async fn run(&self) -> HarnessResult<SelfCheckReport> {
        let start = Instant::now();
        let mut passed = Vec::new();

        for (name, check) in BUILTIN_CHECKS {
            check().map_err(|reason| HarnessError::SelfCheck {
                check: name.to_string(),
                reason,
            })?;
            debug!(check = %name, "self-check passed");
            passed.push(name.to_string());
        }

        if let Some(command) = &self.config.command {
            let stage = StageConfig::new("self-check", command.clone(), self.config.timeout_secs);
            let result = StageRunner::execute_stage(&stage)
                .await
                .map_err(|e| HarnessError::SelfCheck {
                    check: "command".to_string(),
                    reason: e.to_string(),
                })?;
            if !result.passed() {
                return Err(HarnessError::SelfCheck {
                    check: "command".to_string(),
                    reason: format!(
                        "exited with {:?}: {}",
                        result.exit_code,
                        last_lines(&result.stderr, 10)
                    ),
                });
            }
            passed.push("command".to_string());
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(checks = passed.len(), duration_ms, "self-check passed");
        Ok(SelfCheckReport {
            passed,
            duration_ms,
        })
    }
}

fn ensure(cond: bool, what: &str) -> Result<(), String> {
    if cond {
        Ok(())
    } else {
        Err(what.to_string())
    }
}

fn check_predicate_algebra() -> Result<(), String> {
    let declared = CapabilitySet::new(["core:health", "core:upload", "ext:acme/mirror"]);
    let before = declared.clone();
    ensure(
        requires(Vec::<String>::new()).is_satisfied_by(&CapabilitySet::default()),
        "empty requirement must hold for the empty set",
    )?;
    ensure(
        requires(["core:upload", "ext:acme/mirror"]).is_satisfied_by(&declared),
        "subset requirement must hold",
    )?;
    ensure(
        !requires(["core:upload", "core:download"]).is_satisfied_by(&declared),
        "requirement with a missing token must fail",
    )?;
    ensure(
        !requires(["Core:Upload"]).is_satisfied_by(&declared),
        "matching must be case-sensitive",
    )?;
    ensure(
        !requires(["ext:acme"]).is_satisfied_by(&declared),
        "extension tokens must match exactly",
    )?;
    ensure(declared == before, "predicate evaluation mutated the declared set")
}

fn check_extractor_fixture() -> Result<(), String> {
    let records = parse_str(FIXTURE);
    ensure(records.len() == 4, "fixture must yield exactly 4 records")?;

    let ok = &records[0];
    ensure(ok.id == "selfcheck::ok", "id must be suite::name")?;
    ensure(ok.duration_ms == 1234, "1.234s must become 1234ms")?;
    ensure(ok.status == TestStatus::Passed, "bare testcase must pass")?;

    let broken = &records[1];
    ensure(
        broken.status == TestStatus::Failed,
        "failure marker must win over skip marker",
    )?;
    let error = broken.error.as_ref().ok_or("failed record without error")?;
    ensure(
        error.message == "got <script>",
        "entities in failure message must be decoded",
    )?;
    ensure(
        error.trace.contains("trace <raw>"),
        "cdata wrapper must be stripped from the trace",
    )?;
    ensure(broken.skip_reason.is_none(), "failed record carries a skip reason")?;

    let gated = &records[2];
    ensure(gated.status == TestStatus::Skipped, "skip marker must skip")?;
    ensure(gated.duration_ms == 0, "invalid duration must become 0")?;
    ensure(gated.error.is_none(), "skipped record carries an error")?;

    ensure(
        records[3].id == "selfcheck::#4",
        "nameless testcase must get a numeric id",
    )
}

fn check_url_template() -> Result<(), String> {
    let url = resolve_template("http://127.0.0.1:{0}/admin/{1}", &[32768, 9000])
        .map_err(|e| e.to_string())?;
    ensure(
        url == "http://127.0.0.1:32768/admin/9000",
        "positional placeholders must resolve in order",
    )?;
    ensure(
        resolve_template("http://127.0.0.1:{2}", &[1]).is_err(),
        "unresolvable placeholder must be rejected",
    )
}

fn check_log_ring_eviction() -> Result<(), String> {
    let mut ring = LogRing::new("selfcheck", 2);
    for line in ["a", "b", "c"] {
        ring.push(LogStream::Stdout, line.to_string());
    }
    ensure(ring.len() == 2, "ring must hold at most its capacity")?;
    ensure(ring.dropped() == 1, "ring must count evictions")?;
    ensure(ring.tail(2) == "b\nc", "ring must drop the oldest line")
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_checks_pass() {
        for (name, check) in BUILTIN_CHECKS {
            assert_eq!(check(), Ok(()), "check {name} failed");
        }
    }

    #[tokio::test]
    async fn test_run_without_command() {
        let report = SelfCheck::new(SelfCheckConfig::default())
            .run()
            .await
            .expect("self-check");
        assert_eq!(report.passed.len(), BUILTIN_CHECKS.len());
    }

    #[tokio::test]
    async fn test_failing_command_aborts() {
        let config = SelfCheckConfig {
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo broken >&2; exit 2".to_string(),
            ]),
            timeout_secs: 10,
        };
        let err = SelfCheck::new(config).run().await.unwrap_err();
        match err {
            HarnessError::SelfCheck { check, reason } => {
                assert_eq!(check, "command");
                assert!(reason.contains("broken"));
            }
            other => panic!("expected SelfCheck, got {:?}", other),
        }
    }

    #[test]
    fn test_last_lines() {
        assert_eq!(last_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(last_lines("", 2), "");
    }
}
