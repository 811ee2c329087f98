//! Canonical per-test records.

use serde::{Deserialize, Serialize};

use crate::capability::Requirement;

/// Final status of one test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

/// Failure details, present only on failed records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    pub message: String,
    /// Raw trace text as emitted by the runner, decoded.
    pub trace: String,
}

/// Status plus the detail that belongs to it.
///
/// Keeping the detail inside the variant makes "error iff failed" and
/// "skip reason iff skipped" hold by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed(TestFailure),
    Skipped { reason: String },
}

impl Outcome {
    pub fn status(&self) -> TestStatus {
        match self {
            Outcome::Passed => TestStatus::Passed,
            Outcome::Failed(_) => TestStatus::Failed,
            Outcome::Skipped { .. } => TestStatus::Skipped,
        }
    }
}

/// One extracted test result. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: String,
    pub title: String,
    pub file: Option<String>,
    pub status: TestStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub requires: Requirement,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TestFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl TestRecord {
    pub fn new(
        id: String,
        title: String,
        file: Option<String>,
        duration_ms: u64,
        outcome: Outcome,
    ) -> Self {
        let status = outcome.status();
        let (error, skip_reason) = match outcome {
            Outcome::Passed => (None, None),
            Outcome::Failed(failure) => (Some(failure), None),
            Outcome::Skipped { reason } => (None, Some(reason)),
        };
        Self {
            id,
            title,
            file,
            status,
            duration_ms,
            requires: Requirement::default(),
            error,
            skip_reason,
        }
    }

    /// Attach the capability requirement declared for this test.
    pub fn with_requirement(mut self, requires: Requirement) -> Self {
        self.requires = requires;
        self
    }
}

/// Aggregate counts over a record list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
    pub duration_ms: u64,
}

impl RecordSummary {
    pub fn from_records(records: &[TestRecord]) -> Self {
        let mut summary = RecordSummary::default();
        for record in records {
            match record.status {
                TestStatus::Passed => summary.passed += 1,
                TestStatus::Failed => summary.failed += 1,
                TestStatus::Skipped => summary.skipped += 1,
            }
            summary.total += 1;
            summary.duration_ms += record.duration_ms;
        }
        summary
    }
}
