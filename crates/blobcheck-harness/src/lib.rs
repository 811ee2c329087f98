//! blobcheck harness
//!
//! Effectful side of blobcheck:
//! - HTTP readiness probing
//! - target lifecycle (container, compose stack, local command) with
//!   bounded, escalating cleanup
//! - the test runner adapter and the pre-flight self-check
//! - the sequential pipeline tying them together

pub mod adapter;
pub mod lifecycle;
pub mod logbuf;
pub mod pipeline;
pub mod probe;
pub mod runner;
pub mod runtime;
pub mod selfcheck;
pub mod stage;

// Re-export key types
pub use adapter::{ExecutionOutcome, ExecutionRequest, ExitClass, TestExecutionAdapter};
pub use lifecycle::{
    Controller, LifecycleState, StartedTarget, StopTier, TargetResource, TargetStrategy,
};
pub use logbuf::{LogRing, LogStream, SharedLogRing};
pub use pipeline::{ConformancePipeline, RunSummary, TargetFailure};
pub use probe::{HealthProber, ProbeConfig, ProbeError, ProbeSuccess};
pub use runner::{StageError, StageResult, StageRunner};
pub use runtime::RuntimeEnv;
pub use selfcheck::{SelfCheck, SelfCheckReport};
pub use stage::StageConfig;
