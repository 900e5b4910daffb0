//! Shared types and errors for the stepwise run engine.
//!
//! This crate provides the foundational types used across all other stepwise crates:
//! - `StepwiseError`: unified error taxonomy, grouped by [`ErrorCategory`]
//! - `RunStatus`: forward-only lifecycle of a persisted run
//! - `ConfigViolation`: one problem found while validating a run config
//! - `merge_tags` / `RunLineage`: tag precedence and retry lineage rules

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Coarse classification of every [`StepwiseError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad config, bad handle text, unknown output, invalid selection.
    UserInput,
    /// Retry against a drifted pipeline, unresolvable sub-plan.
    Structural,
    /// A defect in the surrounding system (conflicting events, missing nodes).
    Consistency,
    /// The run store or intermediate store could not serve a read or write.
    TransientStore,
}

/// Unified error type for all stepwise subsystems.
#[derive(Debug, thiserror::Error)]
pub enum StepwiseError {
    // === User input errors ===
    #[error("Invalid config for pipeline '{pipeline}': {}", join_violations(.violations))]
    InvalidConfig {
        pipeline: String,
        violations: Vec<ConfigViolation>,
    },

    #[error("Malformed node handle '{text}': {reason}")]
    MalformedHandle { text: String, reason: String },

    #[error("Output '{output}' is not defined on node '{node}'")]
    UnknownOutput { node: String, output: String },

    #[error("Invalid selection for pipeline '{pipeline}': no such node or step: {}", .unknown.join(", "))]
    InvalidSubset {
        pipeline: String,
        unknown: Vec<String>,
    },

    #[error("Pipeline '{name}' is not registered")]
    PipelineNotFound { name: String },

    #[error("Run '{run_id}' not found")]
    RunNotFound { run_id: String },

    // === Structural errors ===
    #[error("Cannot retry run '{parent_run_id}': {reason}")]
    RetryImpossible {
        parent_run_id: String,
        reason: String,
    },

    #[error("Cannot build execution plan for pipeline '{pipeline}': {reason}")]
    PlanBuild { pipeline: String, reason: String },

    // === Consistency errors ===
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Can not find node handle '{handle}' in pipeline '{pipeline}'")]
    HandleNotFound { handle: String, pipeline: String },

    #[error("Run '{run_id}' already exists")]
    RunAlreadyExists { run_id: String },

    #[error("Run '{run_id}' cannot move from {from} to {to}")]
    InvalidStatusTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    // === Store errors ===
    #[error("Store error: {message}")]
    Store { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(|v| v.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl StepwiseError {
    /// Which part of the taxonomy this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            StepwiseError::InvalidConfig { .. }
            | StepwiseError::MalformedHandle { .. }
            | StepwiseError::UnknownOutput { .. }
            | StepwiseError::InvalidSubset { .. }
            | StepwiseError::PipelineNotFound { .. }
            | StepwiseError::RunNotFound { .. } => ErrorCategory::UserInput,
            StepwiseError::RetryImpossible { .. } | StepwiseError::PlanBuild { .. } => {
                ErrorCategory::Structural
            }
            StepwiseError::Invariant(_)
            | StepwiseError::HandleNotFound { .. }
            | StepwiseError::RunAlreadyExists { .. }
            | StepwiseError::InvalidStatusTransition { .. } => ErrorCategory::Consistency,
            StepwiseError::Store { .. } | StepwiseError::Io(_) | StepwiseError::Json(_) => {
                ErrorCategory::TransientStore
            }
        }
    }

    /// Returns `true` if a caller may reasonably retry the same operation.
    ///
    /// Nothing in this workspace retries on its own; the policy belongs to the caller.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::TransientStore
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }

    pub fn store(message: impl Into<String>) -> Self {
        StepwiseError::Store {
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        StepwiseError::Invariant(message.into())
    }
}

/// A convenience alias for `Result<T, StepwiseError>`.
pub type Result<T> = std::result::Result<T, StepwiseError>;

// ---------------------------------------------------------------------------
// ConfigViolation: one problem found in a run config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigViolation {
    /// Colon-separated location, e.g. `root:solids:extract:config`.
    pub path: String,
    pub message: String,
}

impl ConfigViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// ---------------------------------------------------------------------------
// RunStatus: lifecycle of a persisted run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Started,
    Success,
    Failure,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failure | RunStatus::Canceled
        )
    }

    /// Whether a run in `self` may move to `next`. Statuses only move forward;
    /// re-asserting the current status is accepted.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            RunStatus::NotStarted => true,
            RunStatus::Started => next.is_terminal(),
            RunStatus::Success | RunStatus::Failure | RunStatus::Canceled => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::NotStarted => "NOT_STARTED",
            RunStatus::Started => "STARTED",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failure => "FAILURE",
            RunStatus::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tags and lineage
// ---------------------------------------------------------------------------

/// Merge run-level tags over pipeline-level tags. Run tags win on collision.
pub fn merge_tags(
    pipeline_tags: &BTreeMap<String, String>,
    run_tags: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = pipeline_tags.clone();
    merged.extend(run_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Root/parent ids recorded on a run for retry lineage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLineage {
    pub root_run_id: Option<String>,
    pub parent_run_id: Option<String>,
}

impl RunLineage {
    /// Lineage for a run that retries `parent_run_id`.
    ///
    /// An explicit root wins. Otherwise the root is the parent's own root, or the
    /// parent itself when the parent was never a retry.
    pub fn for_retry(
        explicit_root: Option<String>,
        parent_run_id: &str,
        parent_root_run_id: Option<&str>,
    ) -> Self {
        let root_run_id = explicit_root
            .or_else(|| parent_root_run_id.map(String::from))
            .unwrap_or_else(|| parent_run_id.to_string());
        Self {
            root_run_id: Some(root_run_id),
            parent_run_id: Some(parent_run_id.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_config_lists_every_violation() {
        let err = StepwiseError::InvalidConfig {
            pipeline: "etl".into(),
            violations: vec![
                ConfigViolation::new("root:solids", "Undefined field \"nope\" at path root:solids"),
                ConfigViolation::new(
                    "root:solids:load:config",
                    "Missing required field \"path\" at path root:solids:load:config",
                ),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Invalid config for pipeline 'etl': Undefined field \"nope\" at path root:solids; \
             Missing required field \"path\" at path root:solids:load:config"
        );
    }

    #[test]
    fn error_display_invalid_subset() {
        let err = StepwiseError::InvalidSubset {
            pipeline: "etl".into(),
            unknown: vec!["ghost".into(), "phantom".into()],
        };
        assert_eq!(
            err.to_string(),
            "Invalid selection for pipeline 'etl': no such node or step: ghost, phantom"
        );
    }

    #[test]
    fn error_display_status_transition() {
        let err = StepwiseError::InvalidStatusTransition {
            run_id: "r1".into(),
            from: RunStatus::Success,
            to: RunStatus::Started,
        };
        assert_eq!(err.to_string(), "Run 'r1' cannot move from SUCCESS to STARTED");
    }

    // --- category ---

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            StepwiseError::UnknownOutput {
                node: "a".into(),
                output: "b".into()
            }
            .category(),
            ErrorCategory::UserInput
        );
        assert_eq!(
            StepwiseError::RetryImpossible {
                parent_run_id: "r".into(),
                reason: "drift".into()
            }
            .category(),
            ErrorCategory::Structural
        );
        assert_eq!(
            StepwiseError::invariant("two terminals").category(),
            ErrorCategory::Consistency
        );
        assert_eq!(
            StepwiseError::HandleNotFound {
                handle: "x".into(),
                pipeline: "p".into()
            }
            .category(),
            ErrorCategory::Consistency
        );
        assert_eq!(
            StepwiseError::store("checkpoint missing").category(),
            ErrorCategory::TransientStore
        );
    }

    #[test]
    fn only_store_errors_are_retryable() {
        assert!(StepwiseError::store("timeout").is_retryable());
        assert!(!StepwiseError::PlanBuild {
            pipeline: "p".into(),
            reason: "missing input".into()
        }
        .is_retryable());
        assert!(StepwiseError::invariant("x").is_terminal());
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StepwiseError = io_err.into();
        assert!(matches!(err, StepwiseError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: StepwiseError = json_err.into();
        assert!(matches!(err, StepwiseError::Json(_)));
    }

    // --- RunStatus ---

    #[test]
    fn status_moves_forward_only() {
        assert!(RunStatus::NotStarted.can_transition_to(RunStatus::Started));
        assert!(RunStatus::NotStarted.can_transition_to(RunStatus::Canceled));
        assert!(RunStatus::Started.can_transition_to(RunStatus::Failure));
        assert!(RunStatus::Started.can_transition_to(RunStatus::Started));
        assert!(!RunStatus::Started.can_transition_to(RunStatus::NotStarted));
        assert!(!RunStatus::Success.can_transition_to(RunStatus::Failure));
        assert!(!RunStatus::Canceled.can_transition_to(RunStatus::Started));
    }

    #[test]
    fn status_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::NotStarted).unwrap(),
            "\"not_started\""
        );
        let status: RunStatus = serde_json::from_str("\"canceled\"").unwrap();
        assert_eq!(status, RunStatus::Canceled);
    }

    // --- tags and lineage ---

    #[test]
    fn run_tags_win_on_collision() {
        let pipeline: BTreeMap<String, String> = [("team".to_string(), "x".to_string())].into();
        let run: BTreeMap<String, String> = [
            ("team".to_string(), "y".to_string()),
            ("env".to_string(), "prod".to_string()),
        ]
        .into();

        let merged = merge_tags(&pipeline, &run);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["team"], "y");
        assert_eq!(merged["env"], "prod");
    }

    #[test]
    fn lineage_inherits_parent_root() {
        let lineage = RunLineage::for_retry(None, "R1", Some("R0"));
        assert_eq!(lineage.root_run_id.as_deref(), Some("R0"));
        assert_eq!(lineage.parent_run_id.as_deref(), Some("R1"));
    }

    #[test]
    fn lineage_root_defaults_to_parent_without_root() {
        let lineage = RunLineage::for_retry(None, "R0", None);
        assert_eq!(lineage.root_run_id.as_deref(), Some("R0"));
    }

    #[test]
    fn lineage_explicit_root_wins() {
        let lineage = RunLineage::for_retry(Some("Rx".into()), "R1", Some("R0"));
        assert_eq!(lineage.root_run_id.as_deref(), Some("Rx"));
    }
}
