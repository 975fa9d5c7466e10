//! Error taxonomy for the orchestration layer
//!
//! Every fatal condition of a run or a resume maps onto one variant here, and
//! each variant carries enough context to name the failing component and,
//! where one applies, the work unit.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Pipeline stage in which a reader/collector member failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Begin,
    Read,
    Collect,
    Merge,
    End,
    Snapshot,
    Restore,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Begin => "begin",
            Stage::Read => "read",
            Stage::Collect => "collect",
            Stage::Merge => "merge",
            Stage::End => "end",
            Stage::Snapshot => "snapshot",
            Stage::Restore => "restore",
        };
        f.write_str(name)
    }
}

/// Main error type for loop, facade, checkpoint and resume operations
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("{role} #{index} ({kind}) failed during {stage}{}", unit_suffix(.unit))]
    MemberFailed {
        stage: Stage,
        role: &'static str,
        index: usize,
        kind: String,
        unit: Option<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error("Task {task_id} for work unit '{unit}' failed: {message}")]
    TaskFailed {
        task_id: u64,
        unit: String,
        message: String,
    },

    #[error("{component} is {actual}, expected {expected}")]
    InvalidState {
        component: &'static str,
        expected: &'static str,
        actual: String,
    },

    #[error("Failed to write checkpoint {path}")]
    CheckpointWrite {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Failed to read checkpoint {path}")]
    CheckpointRead {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(
        "Checkpoint {path} has format version {recorded}, this build reads version {running}"
    )]
    CheckpointVersion {
        path: PathBuf,
        recorded: u32,
        running: u32,
    },

    #[error("Failed to extract runtime modules from {archive}")]
    Extraction {
        archive: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Lock marker {marker} still present after {waited:?}")]
    LockTimeout { marker: PathBuf, waited: Duration },

    #[error("No {role} kind '{kind}' is registered")]
    UnknownKind { role: &'static str, kind: String },

    #[error("{backend} backend: {message}")]
    Backend {
        backend: &'static str,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Run interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn unit_suffix(unit: &Option<String>) -> String {
    unit.as_ref()
        .map(|name| format!(" on work unit '{}'", name))
        .unwrap_or_default()
}

impl LoopError {
    /// Create a backend error without an underlying source
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
            source: None,
        }
    }

    /// Create a backend error wrapping an underlying source
    pub fn backend_with_source(
        backend: &'static str,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Message including every underlying cause
    pub fn chain(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }

    /// Process exit status for a fatal error of this class
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted => 130,
            Self::CheckpointRead { .. } | Self::CheckpointVersion { .. } => 3,
            Self::Extraction { .. } | Self::LockTimeout { .. } => 4,
            Self::Config(_) => 2,
            _ => 1,
        }
    }
}

/// Result alias used throughout the crate
pub type LoopResult<T> = std::result::Result<T, LoopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_failure_names_unit_and_kind() {
        let err = LoopError::MemberFailed {
            stage: Stage::Read,
            role: "reader",
            index: 1,
            kind: "field_sum".to_string(),
            unit: Some("TTJets".to_string()),
            source: anyhow::anyhow!("missing field"),
        };
        let message = err.to_string();
        assert!(message.contains("reader #1 (field_sum)"));
        assert!(message.contains("during read"));
        assert!(message.contains("'TTJets'"));
    }

    #[test]
    fn test_member_failure_without_unit() {
        let err = LoopError::MemberFailed {
            stage: Stage::End,
            role: "collector",
            index: 0,
            kind: "sum".to_string(),
            unit: None,
            source: anyhow::anyhow!("boom"),
        };
        assert_eq!(err.to_string(), "collector #0 (sum) failed during end");
    }

    #[test]
    fn test_exit_codes_are_non_zero() {
        let errors = vec![
            LoopError::Interrupted,
            LoopError::Config("bad".into()),
            LoopError::CheckpointVersion {
                path: PathBuf::from("reader_state.json.gz"),
                recorded: 9,
                running: 1,
            },
            LoopError::LockTimeout {
                marker: PathBuf::from(".extracting"),
                waited: Duration::from_secs(1),
            },
            LoopError::backend("subprocess", "gone"),
        ];
        for err in errors {
            assert_ne!(err.exit_code(), 0, "{err}");
        }
    }

    #[test]
    fn test_version_mismatch_reports_both_versions() {
        let err = LoopError::CheckpointVersion {
            path: PathBuf::from("/wa/reader_state.json.gz"),
            recorded: 7,
            running: 1,
        };
        let message = err.to_string();
        assert!(message.contains("/wa/reader_state.json.gz"));
        assert!(message.contains("version 7"));
        assert!(message.contains("version 1"));
    }
}
