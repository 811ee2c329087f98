//! blobcheck core library
//!
//! Domain model for conformance-testing blob storage servers:
//! - target descriptors and root configuration
//! - the capability predicate engine that gates tests per target
//! - extraction of raw runner output into canonical test records
//! - result bundles, coverage tables and the run manifest

pub mod capability;
pub mod config;
pub mod error;
pub mod extract;
pub mod obs;
pub mod record;
pub mod reporter;
pub mod run;
pub mod telemetry;

pub use capability::{
    requires, Capability, CapabilitySet, CatalogEntry, GatePlan, GatedTest, Requirement,
    CAPABILITIES_ENV, EXTENSION_PREFIX,
};
pub use config::{
    resolve_template, CommandSpec, ComposeSpec, ContainerSpec, ProbeSpec, ResourceLimits,
    RootConfig, RunnerConfig, SecretBag, SelfCheckConfig, StartStrategy, TargetSpec,
    DEFAULT_LOG_BUFFER_CAPACITY,
};
pub use error::{HarnessError, HarnessResult};
pub use extract::{annotate_records, parse_file, parse_str};
pub use record::{Outcome, RecordSummary, TestFailure, TestRecord, TestStatus};
pub use reporter::{
    CoverageRow, CoverageTable, ReportEmitter, ReportSink, ResultBundle, ServerMetadata,
    TargetReport,
};
pub use run::{ManifestEntry, RunId, RunManifest};

/// blobcheck version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
