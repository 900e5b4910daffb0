//! Pipeline definitions and the execution plans derived from them.
//!
//! A [`PipelineDefinition`] is a tree of nodes: composite nodes group children,
//! leaf nodes compute. Each leaf yields one `compute` step plus one
//! `input_thunk` step per input that is fed from run config rather than wired to
//! an upstream output. The resulting [`ExecutionPlanSnapshot`] lists steps in a
//! deterministic topological order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use stepwise_types::{Result, StepwiseError};

use crate::config::ConfigField;
use crate::events::{StepKind, StepOutputHandle};
use crate::handle::NodeHandle;
use crate::selection::{ancestors, descendants};

pub const DEFAULT_OUTPUT: &str = "result";
pub const DEFAULT_MODE: &str = "default";
pub const THUNK_OUTPUT: &str = "input_thunk_output";

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Declared type of an input or output value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    Any,
    Bool,
    Int,
    Float,
    String,
    List,
    Dict,
}

impl ValueType {
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            ValueType::Any => true,
            ValueType::Bool => value.is_boolean(),
            ValueType::Int => value.is_i64() || value.is_u64(),
            ValueType::Float => value.is_number(),
            ValueType::String => value.is_string(),
            ValueType::List => value.is_array(),
            ValueType::Dict => value.is_object(),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Any => "Any",
            ValueType::Bool => "Bool",
            ValueType::Int => "Int",
            ValueType::Float => "Float",
            ValueType::String => "String",
            ValueType::List => "List",
            ValueType::Dict => "Dict",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    /// Upstream output this input reads: `handle` or `handle:output`. When
    /// absent the value comes from run config through an input thunk step.
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Vec<InputDefinition>,
    #[serde(default)]
    pub outputs: Vec<OutputDefinition>,
    #[serde(default)]
    pub config: Option<ConfigField>,
    #[serde(default)]
    pub children: Vec<NodeDefinition>,
}

impl NodeDefinition {
    /// A computing node. Gets a single `result` output unless outputs are added.
    pub fn leaf(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            config: None,
            children: Vec::new(),
        }
    }

    /// A node that groups `children` and computes nothing itself.
    pub fn composite(name: impl Into<String>, children: Vec<NodeDefinition>) -> Self {
        Self {
            children,
            ..Self::leaf(name)
        }
    }

    /// Wire input `name` to an upstream output (`handle` or `handle:output`).
    pub fn with_input(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.inputs.push(InputDefinition {
            name: name.into(),
            value_type: ValueType::Any,
            source: Some(source.into()),
        });
        self
    }

    /// Input whose value is supplied by run config.
    pub fn with_config_input(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.inputs.push(InputDefinition {
            name: name.into(),
            value_type,
            source: None,
        });
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.outputs.push(OutputDefinition {
            name: name.into(),
            value_type,
        });
        self
    }

    pub fn with_config(mut self, field: ConfigField) -> Self {
        self.config = Some(field);
        self
    }

    pub fn is_composite(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn output(&self, name: &str) -> Option<&OutputDefinition> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.output(name).is_some()
    }

    pub fn child(&self, name: &str) -> Option<&NodeDefinition> {
        self.children.iter().find(|c| c.name == name)
    }

    fn normalize(&mut self) {
        if !self.is_composite() && self.outputs.is_empty() {
            self.outputs.push(OutputDefinition {
                name: DEFAULT_OUTPUT.to_string(),
                value_type: ValueType::Any,
            });
        }
        for child in &mut self.children {
            child.normalize();
        }
    }
}

fn default_modes() -> Vec<String> {
    vec![DEFAULT_MODE.to_string()]
}

/// The explicit, passed-around description of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default = "default_modes")]
    pub modes: Vec<String>,
    pub nodes: Vec<NodeDefinition>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, nodes: Vec<NodeDefinition>) -> Self {
        let mut def = Self {
            name: name.into(),
            description: None,
            tags: BTreeMap::new(),
            modes: default_modes(),
            nodes,
        };
        def.normalize();
        def
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        let mode = mode.into();
        if !self.modes.contains(&mode) {
            self.modes.push(mode);
        }
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Parse a JSON definition and check that it yields a valid plan.
    pub fn from_json(source: &str) -> Result<Self> {
        let mut def: PipelineDefinition = serde_json::from_str(source)?;
        def.normalize();
        def.execution_plan()?;
        Ok(def)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json(&source)
    }

    fn normalize(&mut self) {
        for node in &mut self.nodes {
            node.normalize();
        }
    }

    pub fn has_mode(&self, mode: &str) -> bool {
        self.modes.iter().any(|m| m == mode)
    }

    pub fn has_node_named(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }

    /// Look up a node at any depth.
    pub fn node(&self, handle: &NodeHandle) -> Option<&NodeDefinition> {
        let mut segments = handle.segments().iter();
        let first = segments.next()?;
        let mut current = self.nodes.iter().find(|n| &n.name == first)?;
        for segment in segments {
            current = current.child(segment)?;
        }
        Some(current)
    }

    /// All leaf nodes with their handles, in declaration order.
    pub fn leaves(&self) -> Result<Vec<(NodeHandle, &NodeDefinition)>> {
        let mut out = Vec::new();
        collect_leaves(&self.name, &self.nodes, None, &mut out)?;
        Ok(out)
    }

    /// Build the full execution plan for this pipeline.
    pub fn execution_plan(&self) -> Result<ExecutionPlanSnapshot> {
        let leaves = self.leaves()?;
        let leaf_index: HashMap<&NodeHandle, &NodeDefinition> =
            leaves.iter().map(|(h, n)| (h, *n)).collect();

        let mut steps = Vec::new();
        for (handle, node) in &leaves {
            let mut inputs = Vec::new();
            for input in &node.inputs {
                let source = match &input.source {
                    Some(text) => self.resolve_source(handle, &input.name, text, &leaf_index)?,
                    None => {
                        let thunk_key = input_thunk_step_key(handle, &input.name);
                        steps.push(ExecutionStep {
                            key: thunk_key.clone(),
                            node_handle: handle.clone(),
                            kind: StepKind::InputThunk,
                            inputs: Vec::new(),
                            outputs: vec![THUNK_OUTPUT.to_string()],
                        });
                        StepOutputHandle::new(thunk_key, THUNK_OUTPUT)
                    }
                };
                inputs.push(StepInput {
                    name: input.name.clone(),
                    source,
                });
            }
            steps.push(ExecutionStep {
                key: compute_step_key(handle),
                node_handle: handle.clone(),
                kind: StepKind::Compute,
                inputs,
                outputs: node.outputs.iter().map(|o| o.name.clone()).collect(),
            });
        }

        let steps = topological_order(&self.name, steps)?;
        Ok(ExecutionPlanSnapshot {
            pipeline_name: self.name.clone(),
            steps,
        })
    }

    fn resolve_source(
        &self,
        handle: &NodeHandle,
        input: &str,
        text: &str,
        leaf_index: &HashMap<&NodeHandle, &NodeDefinition>,
    ) -> Result<StepOutputHandle> {
        let plan_err = |reason: String| StepwiseError::PlanBuild {
            pipeline: self.name.clone(),
            reason,
        };
        let (node_text, output) = text.split_once(':').unwrap_or((text, DEFAULT_OUTPUT));
        let source = NodeHandle::parse(node_text).map_err(|e| {
            plan_err(format!("input '{}' of node '{}': {}", input, handle, e))
        })?;
        let Some(source_node) = leaf_index.get(&source) else {
            let reason = if self.node(&source).is_some() {
                format!(
                    "input '{}' of node '{}' reads from composite '{}'; wire it to one of its children",
                    input, handle, source
                )
            } else {
                format!(
                    "input '{}' of node '{}' reads from unknown node '{}'",
                    input, handle, source
                )
            };
            return Err(plan_err(reason));
        };
        if !source_node.has_output(output) {
            return Err(plan_err(format!(
                "input '{}' of node '{}' reads undefined output '{}' of '{}'",
                input, handle, output, source
            )));
        }
        Ok(StepOutputHandle::new(compute_step_key(&source), output))
    }
}

fn collect_leaves<'a>(
    pipeline: &str,
    nodes: &'a [NodeDefinition],
    parent: Option<&NodeHandle>,
    out: &mut Vec<(NodeHandle, &'a NodeDefinition)>,
) -> Result<()> {
    let mut seen = BTreeSet::new();
    for node in nodes {
        let handle = match parent {
            Some(p) => p.child(&node.name)?,
            None => NodeHandle::root(&node.name)?,
        };
        if !seen.insert(node.name.as_str()) {
            return Err(StepwiseError::PlanBuild {
                pipeline: pipeline.to_string(),
                reason: format!("node '{}' is defined more than once", handle),
            });
        }
        if node.is_composite() {
            if !node.inputs.is_empty() {
                return Err(StepwiseError::PlanBuild {
                    pipeline: pipeline.to_string(),
                    reason: format!(
                        "composite '{}' declares inputs; declare them on its children",
                        handle
                    ),
                });
            }
            if !node.outputs.is_empty() {
                return Err(StepwiseError::PlanBuild {
                    pipeline: pipeline.to_string(),
                    reason: format!(
                        "composite '{}' declares outputs; read them from its children",
                        handle
                    ),
                });
            }
            collect_leaves(pipeline, &node.children, Some(&handle), out)?;
        } else {
            out.push((handle, node));
        }
    }
    Ok(())
}

pub fn compute_step_key(handle: &NodeHandle) -> String {
    format!("{}.compute", handle)
}

pub fn input_thunk_step_key(handle: &NodeHandle, input: &str) -> String {
    format!("{}.inputs.{}.read", handle, input)
}

/// Kahn's algorithm, always releasing the earliest-declared ready step so the
/// order is stable for a given definition.
fn topological_order(pipeline: &str, steps: Vec<ExecutionStep>) -> Result<Vec<ExecutionStep>> {
    let index: HashMap<String, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.key.clone(), i))
        .collect();

    let mut indegree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in step.upstream_keys() {
            if let Some(&d) = index.get(dep.as_str()) {
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() < steps.len() {
        let stuck: Vec<&str> = (0..steps.len())
            .filter(|i| indegree[*i] > 0)
            .map(|i| steps[i].key.as_str())
            .collect();
        return Err(StepwiseError::PlanBuild {
            pipeline: pipeline.to_string(),
            reason: format!("dependency cycle among steps: {}", stuck.join(", ")),
        });
    }

    let mut slots: Vec<Option<ExecutionStep>> = steps.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

// ---------------------------------------------------------------------------
// Execution plans
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInput {
    pub name: String,
    pub source: StepOutputHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub key: String,
    pub node_handle: NodeHandle,
    pub kind: StepKind,
    pub inputs: Vec<StepInput>,
    pub outputs: Vec<String>,
}

impl ExecutionStep {
    pub fn upstream_keys(&self) -> BTreeSet<String> {
        self.inputs
            .iter()
            .map(|i| i.source.step_key.clone())
            .collect()
    }
}

/// Ordered steps of a (possibly restricted) plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlanSnapshot {
    pub pipeline_name: String,
    pub steps: Vec<ExecutionStep>,
}

impl ExecutionPlanSnapshot {
    pub fn step(&self, key: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.step(key).is_some()
    }

    pub fn step_keys(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.key.clone()).collect()
    }

    /// Upstream step keys of every step, including upstreams outside this plan.
    pub fn step_deps(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.steps
            .iter()
            .map(|s| (s.key.clone(), s.upstream_keys()))
            .collect()
    }

    /// `keys` in plan order, dropping keys the plan does not contain.
    pub fn ordered(&self, keys: &BTreeSet<String>) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| keys.contains(&s.key))
            .map(|s| s.key.clone())
            .collect()
    }

    /// `seeds` plus every step in this plan that transitively depends on one.
    pub fn downstream_closure(&self, seeds: &BTreeSet<String>) -> BTreeSet<String> {
        let deps = self.step_deps();
        let mut out = BTreeSet::new();
        for seed in seeds {
            out.extend(descendants(&deps, seed, None));
        }
        out
    }

    /// `seeds` plus every step in this plan they transitively depend on.
    pub fn upstream_closure(&self, seeds: &BTreeSet<String>) -> BTreeSet<String> {
        let deps = self.step_deps();
        let mut out = BTreeSet::new();
        for seed in seeds {
            out.extend(
                ancestors(&deps, seed, None)
                    .into_iter()
                    .filter(|k| self.contains(k)),
            );
        }
        out
    }

    /// Copy of this plan keeping only `keys`, order preserved.
    pub fn restrict(&self, keys: &BTreeSet<String>) -> ExecutionPlanSnapshot {
        ExecutionPlanSnapshot {
            pipeline_name: self.pipeline_name.clone(),
            steps: self
                .steps
                .iter()
                .filter(|s| keys.contains(&s.key))
                .cloned()
                .collect(),
        }
    }

    /// Differences that make this plan's steps incompatible with `current`.
    ///
    /// Steps that only exist in `current` are not drift.
    pub fn structural_drift(&self, current: &ExecutionPlanSnapshot) -> Vec<String> {
        let mut drift = Vec::new();
        if self.pipeline_name != current.pipeline_name {
            drift.push(format!(
                "pipeline changed from '{}' to '{}'",
                self.pipeline_name, current.pipeline_name
            ));
        }
        for step in &self.steps {
            match current.step(&step.key) {
                None => drift.push(format!("step '{}' no longer exists", step.key)),
                Some(now) => {
                    if now.kind != step.kind || now.node_handle != step.node_handle {
                        drift.push(format!("step '{}' changed kind or node", step.key));
                    } else if now.inputs != step.inputs {
                        drift.push(format!("inputs of step '{}' changed", step.key));
                    } else if now.outputs != step.outputs {
                        drift.push(format!("outputs of step '{}' changed", step.key));
                    }
                }
            }
        }
        drift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> PipelineDefinition {
        PipelineDefinition::new(
            "diamond",
            vec![
                NodeDefinition::leaf("a"),
                NodeDefinition::leaf("b").with_input("x", "a"),
                NodeDefinition::leaf("c").with_input("x", "a"),
                NodeDefinition::leaf("d")
                    .with_input("left", "b")
                    .with_input("right", "c"),
            ],
        )
    }

    #[test]
    fn leaves_get_default_result_output() {
        let def = diamond();
        let a = def.node(&NodeHandle::parse("a").unwrap()).unwrap();
        assert!(a.has_output(DEFAULT_OUTPUT));
    }

    #[test]
    fn plan_is_topologically_ordered() {
        let plan = diamond().execution_plan().unwrap();
        assert_eq!(
            plan.step_keys(),
            vec!["a.compute", "b.compute", "c.compute", "d.compute"]
        );
        let deps = plan.step_deps();
        assert_eq!(
            deps["d.compute"],
            BTreeSet::from(["b.compute".to_string(), "c.compute".to_string()])
        );
    }

    #[test]
    fn declaration_order_breaks_ties_after_dependencies() {
        let def = PipelineDefinition::new(
            "p",
            vec![
                NodeDefinition::leaf("late").with_input("x", "early"),
                NodeDefinition::leaf("early"),
            ],
        );
        let plan = def.execution_plan().unwrap();
        assert_eq!(plan.step_keys(), vec!["early.compute", "late.compute"]);
    }

    #[test]
    fn config_inputs_become_thunk_steps() {
        let def = PipelineDefinition::new(
            "p",
            vec![NodeDefinition::leaf("load").with_config_input("path", ValueType::String)],
        );
        let plan = def.execution_plan().unwrap();
        assert_eq!(
            plan.step_keys(),
            vec!["load.inputs.path.read", "load.compute"]
        );
        let thunk = plan.step("load.inputs.path.read").unwrap();
        assert_eq!(thunk.kind, StepKind::InputThunk);
        assert_eq!(thunk.node_handle.to_text(), "load");
    }

    #[test]
    fn composite_children_are_flattened_with_nested_handles() {
        let def = PipelineDefinition::new(
            "nested",
            vec![
                NodeDefinition::leaf("src"),
                NodeDefinition::composite(
                    "outer",
                    vec![NodeDefinition::leaf("inner").with_input("x", "src")],
                ),
            ],
        );
        let plan = def.execution_plan().unwrap();
        assert_eq!(plan.step_keys(), vec!["src.compute", "outer.inner.compute"]);
        assert!(def.node(&NodeHandle::parse("outer.inner").unwrap()).is_some());
        assert!(def.node(&NodeHandle::parse("outer.ghost").unwrap()).is_none());
        assert!(def.node(&NodeHandle::parse("outer").unwrap()).unwrap().is_composite());
    }

    #[test]
    fn unknown_source_fails_plan_build() {
        let def = PipelineDefinition::new(
            "p",
            vec![NodeDefinition::leaf("b").with_input("x", "missing")],
        );
        let err = def.execution_plan().unwrap_err();
        assert!(matches!(err, StepwiseError::PlanBuild { .. }));
        assert!(err.to_string().contains("unknown node 'missing'"));
    }

    #[test]
    fn undefined_source_output_fails_plan_build() {
        let def = PipelineDefinition::new(
            "p",
            vec![
                NodeDefinition::leaf("a"),
                NodeDefinition::leaf("b").with_input("x", "a:nope"),
            ],
        );
        let err = def.execution_plan().unwrap_err();
        assert!(err.to_string().contains("undefined output 'nope'"));
    }

    #[test]
    fn cycles_are_reported() {
        let def = PipelineDefinition::new(
            "p",
            vec![
                NodeDefinition::leaf("a").with_input("x", "b"),
                NodeDefinition::leaf("b").with_input("x", "a"),
            ],
        );
        let err = def.execution_plan().unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let def = PipelineDefinition::new(
            "p",
            vec![NodeDefinition::leaf("a"), NodeDefinition::leaf("a")],
        );
        assert!(def.execution_plan().is_err());
    }

    #[test]
    fn composite_outputs_are_rejected_at_load() {
        let err = PipelineDefinition::from_json(
            r#"{
                "name": "nested",
                "nodes": [
                    {"name": "outer", "outputs": [{"name": "result"}],
                     "children": [{"name": "inner"}]}
                ]
            }"#,
        )
        .unwrap_err();
        match err {
            StepwiseError::PlanBuild { reason, .. } => {
                assert!(reason.contains("composite 'outer' declares outputs"), "{reason}");
            }
            other => panic!("expected PlanBuild, got {other:?}"),
        }

        let plain = PipelineDefinition::new(
            "nested",
            vec![NodeDefinition::composite("outer", vec![NodeDefinition::leaf("inner")])],
        );
        let outer = plain.node(&NodeHandle::parse("outer").unwrap()).unwrap();
        assert!(outer.outputs.is_empty());
        assert!(plain.execution_plan().is_ok());
    }

    #[test]
    fn closures_follow_dependencies() {
        let plan = diamond().execution_plan().unwrap();
        let down = plan.downstream_closure(&BTreeSet::from(["b.compute".to_string()]));
        assert_eq!(
            down,
            BTreeSet::from(["b.compute".to_string(), "d.compute".to_string()])
        );
        let up = plan.upstream_closure(&BTreeSet::from(["d.compute".to_string()]));
        assert_eq!(up.len(), 4);
    }

    #[test]
    fn drift_detects_changed_inputs_and_missing_steps() {
        let before = diamond().execution_plan().unwrap();
        assert!(before.structural_drift(&before).is_empty());

        let after = PipelineDefinition::new(
            "diamond",
            vec![
                NodeDefinition::leaf("a"),
                NodeDefinition::leaf("b"),
                NodeDefinition::leaf("c").with_input("x", "a"),
            ],
        )
        .execution_plan()
        .unwrap();

        let drift = before.structural_drift(&after);
        assert!(drift.iter().any(|d| d.contains("inputs of step 'b.compute'")));
        assert!(drift.iter().any(|d| d.contains("'d.compute' no longer exists")));
    }

    #[test]
    fn from_json_parses_and_checks_definition() {
        let def = PipelineDefinition::from_json(
            r#"{
                "name": "etl",
                "tags": {"team": "data"},
                "nodes": [
                    {"name": "extract", "outputs": [{"name": "rows", "type": "list"}]},
                    {"name": "count", "inputs": [{"name": "rows", "source": "extract:rows"}],
                     "outputs": [{"name": "result", "type": "int"}]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(def.modes, vec!["default"]);
        assert_eq!(def.tags["team"], "data");
        let count = def.node(&NodeHandle::parse("count").unwrap()).unwrap();
        assert_eq!(count.output("result").unwrap().value_type, ValueType::Int);

        let broken = PipelineDefinition::from_json(
            r#"{"name": "bad", "nodes": [{"name": "x", "inputs": [{"name": "i", "source": "y"}]}]}"#,
        );
        assert!(broken.is_err());
    }

    #[test]
    fn value_type_acceptance() {
        assert!(ValueType::Int.accepts(&serde_json::json!(42)));
        assert!(!ValueType::Int.accepts(&serde_json::json!(4.2)));
        assert!(ValueType::Float.accepts(&serde_json::json!(4)));
        assert!(ValueType::Any.accepts(&serde_json::Value::Null));
        assert!(!ValueType::String.accepts(&serde_json::json!(true)));
    }
}
