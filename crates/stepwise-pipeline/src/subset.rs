//! Deciding which steps a new run executes.
//!
//! Three shapes of request are handled:
//!
//! - a full run executes every step of the current plan
//! - a node or step selection executes the selected steps plus everything
//!   upstream of them
//! - a retry executes what did not succeed in the parent run, plus every step
//!   downstream of that, limited to the parent run's own plan

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use stepwise_types::{Result, StepwiseError};

use crate::definition::{ExecutionPlanSnapshot, PipelineDefinition};
use crate::events::{StepEvent, StepEventData, StepEventKind, StepOutputHandle};
use crate::handle::NodeHandle;
use crate::run::{PipelineRun, RunRequest};
use crate::selection::parse_step_selection;

/// Step keys resolved for a run, in plan order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSubset {
    pub step_keys: Vec<String>,
    /// The node selection exactly as requested (or inherited by a retry).
    pub node_selection: Option<Vec<String>>,
    /// `true` when no selection or retry narrowed the plan.
    pub is_full: bool,
}

impl StepSubset {
    /// What to record as the run's steps to execute. `None` means all of them.
    pub fn to_execute(&self) -> Option<Vec<String>> {
        if self.is_full {
            None
        } else {
            Some(self.step_keys.clone())
        }
    }
}

/// What happened to each step of a parent run, read from its events.
#[derive(Debug, Clone)]
pub struct ParentRunOutcome {
    pub run: PipelineRun,
    terminal: BTreeMap<String, StepEventKind>,
    /// Outputs checkpointed by successful steps, in this run or an ancestor it
    /// skipped them for.
    pub available_outputs: BTreeSet<StepOutputHandle>,
}

impl ParentRunOutcome {
    pub fn from_events(run: PipelineRun, events: &[StepEvent]) -> Self {
        let mut terminal = BTreeMap::new();
        let mut outputs: BTreeMap<&str, Vec<&StepOutputHandle>> = BTreeMap::new();
        for event in events {
            match &event.data {
                StepEventData::Output { output } => {
                    outputs.entry(event.step_key.as_str()).or_default().push(output)
                }
                StepEventData::Success { .. }
                | StepEventData::Failure { .. }
                | StepEventData::Skipped => {
                    // first terminal event wins; conflicts surface in result queries
                    terminal
                        .entry(event.step_key.clone())
                        .or_insert_with(|| event.kind());
                }
                StepEventData::Input { .. }
                | StepEventData::Materialization { .. }
                | StepEventData::ExpectationResult { .. } => {}
            }
        }
        let available_outputs = outputs
            .into_iter()
            .filter(|(key, _)| terminal.get(*key) == Some(&StepEventKind::StepSuccess))
            .flat_map(|(_, handles)| handles.into_iter().cloned())
            .collect();
        Self {
            run,
            terminal,
            available_outputs,
        }
    }

    /// Terminal event kind recorded for `step_key`, if any.
    pub fn outcome(&self, step_key: &str) -> Option<StepEventKind> {
        self.terminal.get(step_key).copied()
    }

    pub fn succeeded(&self, step_key: &str) -> bool {
        self.outcome(step_key) == Some(StepEventKind::StepSuccess)
    }

    /// Add outputs checkpointed by an earlier run in the same lineage.
    pub fn inherit_outputs(&mut self, outputs: impl IntoIterator<Item = StepOutputHandle>) {
        self.available_outputs.extend(outputs);
    }
}

/// Resolve the steps `request` must execute against the `current` plan.
///
/// `parent` is required when the request is a retry.
pub fn resolve(
    request: &RunRequest,
    definition: &PipelineDefinition,
    current: &ExecutionPlanSnapshot,
    parent: Option<&ParentRunOutcome>,
) -> Result<StepSubset> {
    match (&request.parent_run_id, parent) {
        (Some(_), Some(parent)) => resolve_retry(request, definition, current, parent),
        (Some(parent_run_id), None) => Err(StepwiseError::RunNotFound {
            run_id: parent_run_id.clone(),
        }),
        (None, _) => resolve_selection(request, definition, current),
    }
}

fn resolve_selection(
    request: &RunRequest,
    definition: &PipelineDefinition,
    current: &ExecutionPlanSnapshot,
) -> Result<StepSubset> {
    if request.node_selection.is_none() && request.step_selection.is_none() {
        return Ok(StepSubset {
            step_keys: current.step_keys(),
            node_selection: None,
            is_full: true,
        });
    }

    let mut seeds = BTreeSet::new();
    if let Some(nodes) = &request.node_selection {
        seeds.extend(node_steps(definition, current, nodes)?);
    }
    if let Some(queries) = &request.step_selection {
        seeds.extend(parse_step_selection(
            &definition.name,
            &current.step_deps(),
            queries,
        )?);
    }
    let closure = current.upstream_closure(&seeds);

    Ok(StepSubset {
        step_keys: current.ordered(&closure),
        node_selection: request.node_selection.clone(),
        is_full: false,
    })
}

/// Every step belonging to the selected nodes or their descendants.
fn node_steps(
    definition: &PipelineDefinition,
    current: &ExecutionPlanSnapshot,
    nodes: &[String],
) -> Result<BTreeSet<String>> {
    let mut handles = Vec::new();
    let mut unknown = Vec::new();
    for name in nodes {
        match NodeHandle::parse(name) {
            Ok(handle) if definition.node(&handle).is_some() => handles.push(handle),
            _ => unknown.push(name.clone()),
        }
    }
    if !unknown.is_empty() {
        return Err(StepwiseError::InvalidSubset {
            pipeline: definition.name.clone(),
            unknown,
        });
    }
    Ok(current
        .steps
        .iter()
        .filter(|s| handles.iter().any(|h| s.node_handle.is_or_descends_from(h)))
        .map(|s| s.key.clone())
        .collect())
}

fn resolve_retry(
    request: &RunRequest,
    definition: &PipelineDefinition,
    current: &ExecutionPlanSnapshot,
    parent: &ParentRunOutcome,
) -> Result<StepSubset> {
    let parent_plan = &parent.run.execution_plan;
    let impossible = |reason: String| {
        tracing::warn!(parent_run_id = %parent.run.run_id, %reason, "Retry rejected");
        StepwiseError::RetryImpossible {
            parent_run_id: parent.run.run_id.clone(),
            reason,
        }
    };

    if parent.run.pipeline_name != request.pipeline_name {
        return Err(impossible(format!(
            "parent ran pipeline '{}', not '{}'",
            parent.run.pipeline_name, request.pipeline_name
        )));
    }
    let drift = parent_plan.structural_drift(current);
    if !drift.is_empty() {
        return Err(impossible(format!(
            "pipeline changed since the parent run: {}",
            drift.join("; ")
        )));
    }

    let selected = match &request.step_selection {
        Some(queries) => {
            parse_step_selection(&definition.name, &parent_plan.step_deps(), queries)?
        }
        None => {
            let pending: BTreeSet<String> = parent_plan
                .steps
                .iter()
                .filter(|s| !parent.succeeded(&s.key))
                .map(|s| s.key.clone())
                .collect();
            parent_plan.downstream_closure(&pending)
        }
    };
    let step_keys = parent_plan.ordered(&selected);
    if step_keys.is_empty() {
        return Err(impossible("every step of the parent run already succeeded".into()));
    }

    let node_selection = match &request.node_selection {
        Some(nodes) => {
            node_steps(definition, current, nodes)?;
            Some(nodes.clone())
        }
        None => parent.run.node_selection.clone(),
    };

    Ok(StepSubset {
        step_keys,
        node_selection,
        is_full: false,
    })
}
