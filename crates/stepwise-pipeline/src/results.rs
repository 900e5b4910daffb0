//! Reading results back out of a run's event log.
//!
//! [`aggregate`] indexes a flat event list by step key. Node queries then
//! select every event whose node handle is or descends from the queried
//! handle, so a composite node sees the events of all its nested leaves.
//! Derived facts such as success or output values are computed on demand;
//! output values are read from the intermediate store each time and never
//! cached.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use stepwise_types::{Result, StepwiseError};

use crate::definition::{NodeDefinition, PipelineDefinition, ValueType, DEFAULT_OUTPUT};
use crate::events::{
    ExpectationResult, FailureData, Materialization, StepEvent, StepEventData, StepKind,
    StepOutputHandle,
};
use crate::handle::NodeHandle;
use crate::intermediates::ContextFactory;
use crate::run::PipelineRun;

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Index a run's events. The input order is kept as is.
pub fn aggregate(
    run_id: impl Into<String>,
    events: Vec<StepEvent>,
    definition: Arc<PipelineDefinition>,
) -> ResultView {
    let mut by_step: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, event) in events.iter().enumerate() {
        by_step.entry(event.step_key.clone()).or_default().push(idx);
    }
    ResultView {
        run_id: run_id.into(),
        definition,
        events,
        by_step,
    }
}

/// Like [`aggregate`], also checking that every event belongs to a step the
/// run was meant to execute.
pub fn aggregate_for_run(
    run: &PipelineRun,
    events: Vec<StepEvent>,
    definition: Arc<PipelineDefinition>,
) -> Result<ResultView> {
    if let Some(stray) = events.iter().find(|e| !run.includes_step(&e.step_key)) {
        tracing::warn!(run_id = %run.run_id, step_key = %stray.step_key, "Event outside run subset");
        return Err(StepwiseError::invariant(format!(
            "run '{}' has an event for step '{}', which it was not meant to execute",
            run.run_id, stray.step_key
        )));
    }
    Ok(aggregate(run.run_id.clone(), events, definition))
}

/// Indexed, read-only view over one run's events.
#[derive(Debug, Clone)]
pub struct ResultView {
    run_id: String,
    definition: Arc<PipelineDefinition>,
    events: Vec<StepEvent>,
    by_step: BTreeMap<String, Vec<usize>>,
}

impl ResultView {
    pub fn for_run(
        run: &PipelineRun,
        events: Vec<StepEvent>,
        definition: Arc<PipelineDefinition>,
    ) -> Result<Self> {
        aggregate_for_run(run, events, definition)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// All events in log order.
    pub fn step_event_list(&self) -> &[StepEvent] {
        &self.events
    }

    pub fn events_by_step_key(&self) -> BTreeMap<&str, Vec<&StepEvent>> {
        self.by_step
            .iter()
            .map(|(key, idxs)| (key.as_str(), idxs.iter().map(|&i| &self.events[i]).collect()))
            .collect()
    }

    /// Events of one step in log order. Empty if the step has not run.
    pub fn result_for_step(&self, step_key: &str) -> Vec<&StepEvent> {
        self.by_step
            .get(step_key)
            .map(|idxs| idxs.iter().map(|&i| &self.events[i]).collect())
            .unwrap_or_default()
    }

    /// `true` when no step of the run failed.
    pub fn success(&self) -> bool {
        !self.events.iter().any(StepEvent::is_failure)
    }

    /// Result view of the node at `handle_text`, at any depth.
    pub fn result_for_handle(&self, handle_text: &str) -> Result<NodeResultView<'_>> {
        let handle = NodeHandle::parse(handle_text)?;
        self.view_for(handle)
    }

    /// Result view of a top-level node.
    pub fn result_for_node(&self, name: &str) -> Result<NodeResultView<'_>> {
        let handle = NodeHandle::root(name)?;
        self.view_for(handle)
    }

    /// Views of every top-level node, in definition order.
    pub fn node_result_list(&self) -> Result<Vec<NodeResultView<'_>>> {
        self.definition
            .nodes
            .iter()
            .map(|n| self.result_for_node(&n.name))
            .collect()
    }

    fn view_for(&self, handle: NodeHandle) -> Result<NodeResultView<'_>> {
        let Some(node) = self.definition.node(&handle) else {
            return Err(StepwiseError::HandleNotFound {
                handle: handle.to_text(),
                pipeline: self.definition.name.clone(),
            });
        };

        let mut events_by_kind: BTreeMap<StepKind, Vec<&StepEvent>> = BTreeMap::new();
        let mut terminals: BTreeMap<&str, Vec<&StepEvent>> = BTreeMap::new();
        for event in self
            .events
            .iter()
            .filter(|e| e.node_handle.is_or_descends_from(&handle))
        {
            events_by_kind.entry(event.step_kind).or_default().push(event);
            if event.is_terminal() {
                terminals.entry(event.step_key.as_str()).or_default().push(event);
            }
        }

        if let Some((step_key, found)) = terminals.iter().find(|(_, found)| found.len() > 1) {
            let kinds: Vec<String> = found.iter().map(|e| e.kind().to_string()).collect();
            tracing::warn!(run_id = %self.run_id, %step_key, "Conflicting terminal events");
            return Err(StepwiseError::invariant(format!(
                "step '{}' of run '{}' has {} terminal events: {}",
                step_key,
                self.run_id,
                found.len(),
                kinds.join(", ")
            )));
        }

        Ok(NodeResultView {
            run_id: &self.run_id,
            node,
            handle,
            events_by_kind,
        })
    }
}

// ---------------------------------------------------------------------------
// Node result views
// ---------------------------------------------------------------------------

/// Value of a node output, or the marker for a node that did not succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    Value(Value),
    NoValue,
}

impl OutputValue {
    pub fn into_option(self) -> Option<Value> {
        match self {
            OutputValue::Value(v) => Some(v),
            OutputValue::NoValue => None,
        }
    }

    pub fn is_no_value(&self) -> bool {
        matches!(self, OutputValue::NoValue)
    }
}

/// Projection of a [`ResultView`] onto one node and its descendants.
#[derive(Debug, Clone)]
pub struct NodeResultView<'a> {
    run_id: &'a str,
    node: &'a NodeDefinition,
    handle: NodeHandle,
    events_by_kind: BTreeMap<StepKind, Vec<&'a StepEvent>>,
}

impl<'a> NodeResultView<'a> {
    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    pub fn node(&self) -> &NodeDefinition {
        self.node
    }

    pub fn events_of_kind(&self, kind: StepKind) -> &[&'a StepEvent] {
        self.events_by_kind
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn compute_step_events(&self) -> &[&'a StepEvent] {
        self.events_of_kind(StepKind::Compute)
    }

    /// At least one compute step succeeded and none failed.
    pub fn success(&self) -> bool {
        let mut any_success = false;
        for event in self.compute_step_events() {
            match event.data {
                StepEventData::Failure { .. } => return false,
                StepEventData::Success { .. } => any_success = true,
                _ => {}
            }
        }
        any_success
    }

    /// Every compute event is a skip. Holds for a node with no compute events.
    pub fn skipped(&self) -> bool {
        self.compute_step_events()
            .iter()
            .all(|e| matches!(e.data, StepEventData::Skipped))
    }

    /// Output events of the node's own compute step.
    fn own_outputs(&self) -> impl Iterator<Item = &'a StepOutputHandle> + '_ {
        self.compute_step_events()
            .iter()
            .copied()
            .filter(|e| e.node_handle == self.handle)
            .filter_map(|e| e.output())
    }

    fn output_type(&self, name: &str) -> ValueType {
        self.node
            .output(name)
            .map(|o| o.value_type)
            .unwrap_or_default()
    }

    /// Read one output back from the intermediate store.
    ///
    /// A context is acquired from `contexts` for the read and released before
    /// returning, whether or not the read succeeds.
    pub async fn output_value(
        &self,
        contexts: &dyn ContextFactory,
        output_name: &str,
    ) -> Result<OutputValue> {
        if !self.node.has_output(output_name) {
            return Err(StepwiseError::UnknownOutput {
                node: self.handle.to_text(),
                output: output_name.to_string(),
            });
        }
        if !self.success() {
            return Ok(OutputValue::NoValue);
        }

        let Some(output) = self.own_outputs().find(|o| o.output_name == output_name) else {
            return Err(StepwiseError::invariant(format!(
                "node '{}' succeeded in run '{}' without recording output '{}'",
                self.handle, self.run_id, output_name
            )));
        };

        let context = contexts.acquire(self.run_id).await?;
        let value = context
            .read_output(output, self.output_type(output_name))
            .await?;
        tracing::debug!(run_id = %self.run_id, output = %output, "Output reconstructed");
        Ok(OutputValue::Value(value))
    }

    /// [`output_value`](Self::output_value) for the default `result` output.
    pub async fn result_value(&self, contexts: &dyn ContextFactory) -> Result<OutputValue> {
        self.output_value(contexts, DEFAULT_OUTPUT).await
    }

    /// Every recorded output by name, read under a single context. `None`
    /// unless the node succeeded.
    pub async fn output_values(
        &self,
        contexts: &dyn ContextFactory,
    ) -> Result<Option<BTreeMap<String, Value>>> {
        if !self.success() {
            return Ok(None);
        }
        let context = contexts.acquire(self.run_id).await?;
        let mut values = BTreeMap::new();
        for output in self.own_outputs() {
            let value = context
                .read_output(output, self.output_type(&output.output_name))
                .await?;
            values.insert(output.output_name.clone(), value);
        }
        Ok(Some(values))
    }

    pub fn failures(&self) -> Vec<&'a StepEvent> {
        self.compute_step_events()
            .iter()
            .copied()
            .filter(|e| e.is_failure())
            .collect()
    }

    /// The single compute failure of a node that did not succeed.
    pub fn compute_step_failure_event(&self) -> Result<&'a StepEvent> {
        if self.success() {
            return Err(StepwiseError::invariant(format!(
                "node '{}' succeeded and has no failure event",
                self.handle
            )));
        }
        match self.failures().as_slice() {
            [one] => Ok(*one),
            found => Err(StepwiseError::invariant(format!(
                "node '{}' in run '{}' has {} compute failures, expected exactly one",
                self.handle,
                self.run_id,
                found.len()
            ))),
        }
    }

    /// Failure diagnostics. `None` for a node that succeeded or never failed.
    ///
    /// For a composite node whose children failed in separate steps, the
    /// earliest failure is returned. Use
    /// [`compute_step_failure_event`](Self::compute_step_failure_event) to
    /// require exactly one failure instead.
    pub fn failure_data(&self) -> Result<Option<&'a FailureData>> {
        if self.success() {
            return Ok(None);
        }
        let failures = self.failures();
        let Some(&first) = failures.first() else {
            return Ok(None);
        };
        if failures.iter().filter(|e| e.step_key == first.step_key).count() > 1 {
            return Err(StepwiseError::invariant(format!(
                "step '{}' in run '{}' failed more than once",
                first.step_key, self.run_id
            )));
        }
        match &first.data {
            StepEventData::Failure { error } => Ok(Some(error)),
            _ => Err(StepwiseError::invariant("failure event without failure data")),
        }
    }

    pub fn input_events(&self) -> Vec<&'a StepEvent> {
        self.compute_step_events()
            .iter()
            .copied()
            .filter(|e| matches!(e.data, StepEventData::Input { .. }))
            .collect()
    }

    pub fn output_events(&self) -> Vec<&'a StepEvent> {
        self.compute_step_events()
            .iter()
            .copied()
            .filter(|e| matches!(e.data, StepEventData::Output { .. }))
            .collect()
    }

    /// Input events by input name. A later event for the same name wins.
    pub fn compute_input_event_map(&self) -> BTreeMap<&'a str, &'a StepEvent> {
        self.compute_step_events()
            .iter()
            .copied()
            .filter_map(|e| match &e.data {
                StepEventData::Input { input_name } => Some((input_name.as_str(), e)),
                _ => None,
            })
            .collect()
    }

    /// Output events by output name. A later event for the same name wins.
    pub fn compute_output_event_map(&self) -> BTreeMap<&'a str, &'a StepEvent> {
        self.compute_step_events()
            .iter()
            .copied()
            .filter_map(|e| match &e.data {
                StepEventData::Output { output } => Some((output.output_name.as_str(), e)),
                _ => None,
            })
            .collect()
    }

    pub fn materializations(&self) -> Vec<&'a Materialization> {
        self.compute_step_events()
            .iter()
            .copied()
            .filter_map(|e| match &e.data {
                StepEventData::Materialization { materialization } => Some(materialization),
                _ => None,
            })
            .collect()
    }

    pub fn expectation_results(&self) -> Vec<&'a ExpectationResult> {
        self.compute_step_events()
            .iter()
            .copied()
            .filter_map(|e| match &e.data {
                StepEventData::ExpectationResult { expectation } => Some(expectation),
                _ => None,
            })
            .collect()
    }

    pub fn step_success_event(&self) -> Option<&'a StepEvent> {
        self.compute_step_events()
            .iter()
            .copied()
            .find(|e| matches!(e.data, StepEventData::Success { .. }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
