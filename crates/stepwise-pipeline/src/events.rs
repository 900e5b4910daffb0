//! Step events: the immutable facts a run's event log is made of.
//!
//! Every [`StepEvent`] carries a tagged [`StepEventData`] payload. Consumers
//! dispatch on it with exhaustive matches rather than probing optional fields.
//! [`EventBroadcaster`] fans freshly appended events out over a
//! [`tokio::sync::broadcast`] channel so observers can re-aggregate a run while
//! it is still executing.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::ExecutionStep;
use crate::handle::NodeHandle;

/// Phase of the node that a step belongs to. Only `Compute` steps count toward
/// node-level success, skip, and output semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Compute,
    InputThunk,
    Materialize,
}

/// Payload-free event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepEventKind {
    StepInput,
    StepOutput,
    StepSuccess,
    StepFailure,
    StepSkipped,
    StepMaterialization,
    StepExpectationResult,
}

impl StepEventKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepEventKind::StepSuccess | StepEventKind::StepFailure | StepEventKind::StepSkipped
        )
    }
}

impl fmt::Display for StepEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepEventKind::StepInput => "STEP_INPUT",
            StepEventKind::StepOutput => "STEP_OUTPUT",
            StepEventKind::StepSuccess => "STEP_SUCCESS",
            StepEventKind::StepFailure => "STEP_FAILURE",
            StepEventKind::StepSkipped => "STEP_SKIPPED",
            StepEventKind::StepMaterialization => "STEP_MATERIALIZATION",
            StepEventKind::StepExpectationResult => "STEP_EXPECTATION_RESULT",
        };
        f.write_str(s)
    }
}

/// Where one output of one step is checkpointed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepOutputHandle {
    pub step_key: String,
    pub output_name: String,
}

impl StepOutputHandle {
    pub fn new(step_key: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            step_key: step_key.into(),
            output_name: output_name.into(),
        }
    }
}

impl fmt::Display for StepOutputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.step_key, self.output_name)
    }
}

/// Diagnostics recorded when a step fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureData {
    pub message: String,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub stack: Vec<String>,
}

impl FailureData {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class_name: None,
            stack: Vec::new(),
        }
    }
}

/// An asset a step reported as written somewhere outside the intermediate store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Materialization {
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectationResult {
    pub success: bool,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Kind-specific payload of a [`StepEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum StepEventData {
    #[serde(rename = "STEP_INPUT")]
    Input { input_name: String },
    #[serde(rename = "STEP_OUTPUT")]
    Output { output: StepOutputHandle },
    #[serde(rename = "STEP_SUCCESS")]
    Success {
        #[serde(default)]
        duration_ms: u64,
    },
    #[serde(rename = "STEP_FAILURE")]
    Failure { error: FailureData },
    #[serde(rename = "STEP_SKIPPED")]
    Skipped,
    #[serde(rename = "STEP_MATERIALIZATION")]
    Materialization { materialization: Materialization },
    #[serde(rename = "STEP_EXPECTATION_RESULT")]
    ExpectationResult { expectation: ExpectationResult },
}

impl StepEventData {
    pub fn kind(&self) -> StepEventKind {
        match self {
            StepEventData::Input { .. } => StepEventKind::StepInput,
            StepEventData::Output { .. } => StepEventKind::StepOutput,
            StepEventData::Success { .. } => StepEventKind::StepSuccess,
            StepEventData::Failure { .. } => StepEventKind::StepFailure,
            StepEventData::Skipped => StepEventKind::StepSkipped,
            StepEventData::Materialization { .. } => StepEventKind::StepMaterialization,
            StepEventData::ExpectationResult { .. } => StepEventKind::StepExpectationResult,
        }
    }
}

/// One immutable entry in a run's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub step_key: String,
    pub node_handle: NodeHandle,
    pub step_kind: StepKind,
    pub timestamp: DateTime<Utc>,
    pub data: StepEventData,
}

impl StepEvent {
    pub fn new(
        step_key: impl Into<String>,
        node_handle: NodeHandle,
        step_kind: StepKind,
        data: StepEventData,
    ) -> Self {
        Self {
            step_key: step_key.into(),
            node_handle,
            step_kind,
            timestamp: Utc::now(),
            data,
        }
    }

    /// Event for a step of an execution plan, copying its key, handle, and kind.
    pub fn for_step(step: &ExecutionStep, data: StepEventData) -> Self {
        Self::new(step.key.clone(), step.node_handle.clone(), step.kind, data)
    }

    pub fn kind(&self) -> StepEventKind {
        self.data.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.data, StepEventData::Failure { .. })
    }

    /// The checkpoint handle if this is a `STEP_OUTPUT` event.
    pub fn output(&self) -> Option<&StepOutputHandle> {
        match &self.data {
            StepEventData::Output { output } => Some(output),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcasting appended events
// ---------------------------------------------------------------------------

/// An event together with the run it was appended to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub run_id: String,
    pub event: StepEvent,
}

/// Broadcasts appended events to live observers.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: tokio::sync::broadcast::Sender<LoggedEvent>,
}

impl EventBroadcaster {
    /// Create a new broadcaster with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped; the run
    /// store remains the source of truth.
    pub fn publish(&self, run_id: &str, event: StepEvent) {
        let _ = self.sender.send(LoggedEvent {
            run_id: run_id.to_string(),
            event,
        });
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LoggedEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
