//! Building execution plans restricted to a step subset.

use std::collections::BTreeSet;

use serde_json::Value;
use stepwise_types::{Result, StepwiseError};

use crate::definition::{ExecutionPlanSnapshot, PipelineDefinition};
use crate::events::StepOutputHandle;

pub trait PlanBuilder: Send + Sync {
    /// Plan for `definition`, limited to `subset` when given.
    ///
    /// An included step may read an output of an excluded step only if that
    /// output is in `available`, i.e. already checkpointed by an earlier run.
    fn build_plan(
        &self,
        definition: &PipelineDefinition,
        mode: &str,
        config: &Value,
        subset: Option<&[String]>,
        available: &BTreeSet<StepOutputHandle>,
    ) -> Result<ExecutionPlanSnapshot>;
}

/// Derives the plan from the definition's dependency structure.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubsetPlanBuilder;

impl PlanBuilder for SubsetPlanBuilder {
    fn build_plan(
        &self,
        definition: &PipelineDefinition,
        mode: &str,
        _config: &Value,
        subset: Option<&[String]>,
        available: &BTreeSet<StepOutputHandle>,
    ) -> Result<ExecutionPlanSnapshot> {
        let plan_err = |reason: String| StepwiseError::PlanBuild {
            pipeline: definition.name.clone(),
            reason,
        };
        if !definition.has_mode(mode) {
            return Err(plan_err(format!("unknown mode '{}'", mode)));
        }

        let full = definition.execution_plan()?;
        let Some(subset) = subset else {
            return Ok(full);
        };

        let keys: BTreeSet<String> = subset.iter().cloned().collect();
        let unknown: Vec<&str> = keys
            .iter()
            .filter(|k| !full.contains(k))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(plan_err(format!(
                "steps not in plan: {}",
                unknown.join(", ")
            )));
        }

        let plan = full.restrict(&keys);
        let mut missing = Vec::new();
        for step in &plan.steps {
            for input in &step.inputs {
                if !keys.contains(&input.source.step_key) && !available.contains(&input.source) {
                    missing.push(format!("{} (needed by {})", input.source, step.key));
                }
            }
        }
        if !missing.is_empty() {
            return Err(plan_err(format!(
                "upstream outputs are neither executed nor checkpointed: {}",
                missing.join(", ")
            )));
        }

        tracing::debug!(
            pipeline = %definition.name,
            steps = plan.steps.len(),
            "Built restricted execution plan"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NodeDefinition;

    fn chain() -> PipelineDefinition {
        PipelineDefinition::new(
            "chain",
            vec![
                NodeDefinition::leaf("a"),
                NodeDefinition::leaf("b").with_input("x", "a"),
                NodeDefinition::leaf("c").with_input("x", "b"),
            ],
        )
    }

    fn build(
        subset: Option<&[String]>,
        available: &BTreeSet<StepOutputHandle>,
    ) -> Result<ExecutionPlanSnapshot> {
        SubsetPlanBuilder.build_plan(&chain(), "default", &Value::Null, subset, available)
    }

    #[test]
    fn no_subset_yields_full_plan() {
        let plan = build(None, &BTreeSet::new()).unwrap();
        assert_eq!(plan.steps.len(), 3);
    }

    #[test]
    fn subset_with_unsatisfied_input_fails() {
        let subset = vec!["b.compute".to_string(), "c.compute".to_string()];
        let err = build(Some(&subset), &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, StepwiseError::PlanBuild { .. }));
        assert!(err.to_string().contains("a.compute:result (needed by b.compute)"));
    }

    #[test]
    fn checkpointed_outputs_satisfy_excluded_upstreams() {
        let subset = vec!["c.compute".to_string(), "b.compute".to_string()];
        let available = BTreeSet::from([StepOutputHandle::new("a.compute", "result")]);
        let plan = build(Some(&subset), &available).unwrap();
        assert_eq!(plan.step_keys(), vec!["b.compute", "c.compute"]);
    }

    #[test]
    fn unknown_step_and_mode_fail() {
        let subset = vec!["ghost.compute".to_string()];
        assert!(build(Some(&subset), &BTreeSet::new()).is_err());
        let err = SubsetPlanBuilder
            .build_plan(&chain(), "prod", &Value::Null, None, &BTreeSet::new())
            .unwrap_err();
        assert!(err.to_string().contains("unknown mode 'prod'"));
    }
}
