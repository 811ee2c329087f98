//! Error taxonomy for a conformance run.
//!
//! Each variant maps onto one failure class with a fixed blast radius:
//! configuration and self-check errors abort the run, startup and execution
//! errors abort a single target, extraction errors degrade a bundle, cleanup
//! errors are only ever logged.

/// Errors produced while driving targets through a conformance run.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("target {target} failed to start: {reason}")]
    Startup { target: String, reason: String },

    #[error("test execution for target {target} failed: {reason}")]
    Execution { target: String, reason: String },

    #[error("result extraction from {path} failed: {reason}")]
    Extraction { path: String, reason: String },

    #[error("cleanup of target {target} failed: {reason}")]
    Cleanup { target: String, reason: String },

    #[error("self-check {check} failed: {reason}")]
    SelfCheck { check: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    pub fn startup(target: impl Into<String>, reason: impl ToString) -> Self {
        HarnessError::Startup {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn execution(target: impl Into<String>, reason: impl ToString) -> Self {
        HarnessError::Execution {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn cleanup(target: impl Into<String>, reason: impl ToString) -> Self {
        HarnessError::Cleanup {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable class name, used in run summaries.
    pub fn class(&self) -> &'static str {
        match self {
            HarnessError::Configuration(_) => "configuration",
            HarnessError::Startup { .. } => "startup",
            HarnessError::Execution { .. } => "execution",
            HarnessError::Extraction { .. } => "extraction",
            HarnessError::Cleanup { .. } => "cleanup",
            HarnessError::SelfCheck { .. } => "self_check",
            HarnessError::Serialization(_) | HarnessError::Io(_) => "io",
        }
    }
}

/// Result type for harness operations.
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_error_names_target() {
        let err = HarnessError::startup("minio", "image pull failed");
        let msg = err.to_string();
        assert!(msg.contains("minio"));
        assert!(msg.contains("image pull failed"));
        assert_eq!(err.class(), "startup");
    }

    #[test]
    fn test_configuration_error_display() {
        let err = HarnessError::Configuration("unknown target: nope".to_string());
        assert!(err.to_string().contains("configuration error"));
        assert_eq!(err.class(), "configuration");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: HarnessError = io.into();
        assert_eq!(err.class(), "io");
        assert!(err.to_string().contains("gone"));
    }
}
