//! Run requests and persisted run records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_types::RunStatus;

use crate::definition::{ExecutionPlanSnapshot, DEFAULT_MODE};

fn default_mode() -> String {
    DEFAULT_MODE.to_string()
}

/// Everything a caller supplies to start a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub pipeline_name: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub run_config: Value,
    /// Node handles to run, with everything they depend on.
    #[serde(default)]
    pub node_selection: Option<Vec<String>>,
    /// Step selection queries such as `*b.compute+`.
    #[serde(default)]
    pub step_selection: Option<Vec<String>>,
    #[serde(default)]
    pub root_run_id: Option<String>,
    #[serde(default)]
    pub parent_run_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RunRequest {
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            mode: default_mode(),
            run_config: Value::Null,
            node_selection: None,
            step_selection: None,
            root_run_id: None,
            parent_run_id: None,
            run_id: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.run_config = config;
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn with_node_selection<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_selection = Some(nodes.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_step_selection<I, S>(mut self, queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step_selection = Some(queries.into_iter().map(Into::into).collect());
        self
    }

    /// Resume `parent_run_id`, re-running only what did not succeed.
    pub fn retry_of(mut self, parent_run_id: impl Into<String>) -> Self {
        self.parent_run_id = Some(parent_run_id.into());
        self
    }

    pub fn with_root_run_id(mut self, root_run_id: impl Into<String>) -> Self {
        self.root_run_id = Some(root_run_id.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn is_retry(&self) -> bool {
        self.parent_run_id.is_some()
    }
}

/// A run as persisted in the run store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub pipeline_name: String,
    pub status: RunStatus,
    /// `None` means every step of the pipeline.
    pub step_keys_to_execute: Option<Vec<String>>,
    #[serde(default)]
    pub node_selection: Option<Vec<String>>,
    pub run_config: Value,
    pub mode: String,
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub root_run_id: Option<String>,
    #[serde(default)]
    pub parent_run_id: Option<String>,
    pub execution_plan: ExecutionPlanSnapshot,
    pub created_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Whether events for `step_key` belong in this run.
    pub fn includes_step(&self, step_key: &str) -> bool {
        match &self.step_keys_to_execute {
            Some(keys) => keys.iter().any(|k| k == step_key),
            None => self.execution_plan.contains(step_key),
        }
    }

    pub fn is_retry(&self) -> bool {
        self.parent_run_id.is_some()
    }
}
