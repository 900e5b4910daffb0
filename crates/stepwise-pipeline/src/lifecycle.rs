//! Run creation: validate, resolve, plan, persist.
//!
//! [`RunCoordinator::create_run`] is the only way runs come into being. It
//! writes exactly one record, and only after every check has passed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use stepwise_types::{merge_tags, Result, RunLineage, RunStatus, StepwiseError};

use crate::config::{ConfigValidator, SchemaConfigValidator};
use crate::definition::PipelineDefinition;
use crate::events::StepOutputHandle;
use crate::plan::{PlanBuilder, SubsetPlanBuilder};
use crate::results::ResultView;
use crate::run::{PipelineRun, RunRequest};
use crate::run_store::RunStore;
use crate::subset::{resolve, ParentRunOutcome, StepSubset};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Owns the registered pipelines and the collaborators runs are created with.
pub struct RunCoordinator {
    pipelines: HashMap<String, Arc<PipelineDefinition>>,
    validator: Arc<dyn ConfigValidator>,
    plan_builder: Arc<dyn PlanBuilder>,
    runs: Arc<dyn RunStore>,
}

type Prepared = (Arc<PipelineDefinition>, StepSubset, Option<ParentRunOutcome>);

// ---------------------------------------------------------------------------
// RunCoordinator
// ---------------------------------------------------------------------------

impl RunCoordinator {
    /// Create a coordinator with the schema validator and subset plan builder.
    pub fn new(runs: Arc<dyn RunStore>) -> Self {
        Self {
            pipelines: HashMap::new(),
            validator: Arc::new(SchemaConfigValidator),
            plan_builder: Arc::new(SubsetPlanBuilder),
            runs,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ConfigValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_plan_builder(mut self, plan_builder: Arc<dyn PlanBuilder>) -> Self {
        self.plan_builder = plan_builder;
        self
    }

    /// Register a pipeline, replacing any previous definition with the same name.
    pub fn register_pipeline(&mut self, definition: PipelineDefinition) -> Arc<PipelineDefinition> {
        let definition = Arc::new(definition);
        self.pipelines
            .insert(definition.name.clone(), Arc::clone(&definition));
        definition
    }

    pub fn pipeline(&self, name: &str) -> Result<Arc<PipelineDefinition>> {
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| StepwiseError::PipelineNotFound {
                name: name.to_string(),
            })
    }

    pub fn runs(&self) -> &Arc<dyn RunStore> {
        &self.runs
    }

    /// Validate a request and resolve the steps it would execute. Nothing is
    /// planned or persisted.
    pub async fn resolve_subset(&self, request: &RunRequest) -> Result<StepSubset> {
        let (_, subset, _) = self.prepare(request).await?;
        Ok(subset)
    }

    /// Validate, resolve the step subset, build the plan, and persist the run.
    pub async fn create_run(&self, request: RunRequest) -> Result<PipelineRun> {
        let (definition, subset, parent) = self.prepare(&request).await?;

        // Phase 3: Plan
        let available = parent
            .as_ref()
            .map(|p| p.available_outputs.clone())
            .unwrap_or_default();
        let to_execute = subset.to_execute();
        let plan = self.plan_builder.build_plan(
            &definition,
            &request.mode,
            &request.run_config,
            to_execute.as_deref(),
            &available,
        )?;

        // Phase 4: Persist
        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let lineage = match &parent {
            Some(p) => RunLineage::for_retry(
                request.root_run_id.clone(),
                &p.run.run_id,
                p.run.root_run_id.as_deref(),
            ),
            None => RunLineage {
                root_run_id: request.root_run_id.clone(),
                parent_run_id: None,
            },
        };
        let run = PipelineRun {
            run_id,
            pipeline_name: definition.name.clone(),
            status: RunStatus::NotStarted,
            step_keys_to_execute: to_execute,
            node_selection: subset.node_selection,
            run_config: request.run_config,
            mode: request.mode,
            tags: merge_tags(&definition.tags, &request.tags),
            root_run_id: lineage.root_run_id,
            parent_run_id: lineage.parent_run_id,
            execution_plan: plan,
            created_at: chrono::Utc::now(),
        };
        let run = self.runs.create(run).await?;

        tracing::info!(
            run_id = %run.run_id,
            pipeline = %run.pipeline_name,
            steps = run.execution_plan.steps.len(),
            parent_run_id = ?run.parent_run_id,
            "Run created"
        );
        Ok(run)
    }

    async fn prepare(&self, request: &RunRequest) -> Result<Prepared> {
        // Phase 1: Validate
        let definition = self.pipeline(&request.pipeline_name)?;
        let violations = self
            .validator
            .validate(&definition, &request.mode, &request.run_config);
        if !violations.is_empty() {
            return Err(StepwiseError::InvalidConfig {
                pipeline: definition.name.clone(),
                violations,
            });
        }

        // Phase 2: Resolve
        let current = definition.execution_plan()?;
        let parent = match &request.parent_run_id {
            Some(parent_run_id) => Some(self.load_parent(parent_run_id).await?),
            None => None,
        };
        let subset = resolve(request, &definition, &current, parent.as_ref())?;
        Ok((definition, subset, parent))
    }

    /// Load a parent run with the outputs checkpointed along its whole lineage.
    async fn load_parent(&self, parent_run_id: &str) -> Result<ParentRunOutcome> {
        let run = self.get_run(parent_run_id).await?;
        let events = self.runs.get_run_events(parent_run_id).await?;
        let mut outcome = ParentRunOutcome::from_events(run, &events);

        let mut seen = BTreeSet::from([parent_run_id.to_string()]);
        let mut ancestor = outcome.run.parent_run_id.clone();
        while let Some(id) = ancestor {
            if !seen.insert(id.clone()) {
                return Err(StepwiseError::invariant(format!(
                    "run lineage of '{}' loops back to '{}'",
                    parent_run_id, id
                )));
            }
            let Some(run) = self.runs.get_run(&id).await? else {
                tracing::warn!(run_id = %id, "Ancestor run missing from store");
                break;
            };
            let events = self.runs.get_run_events(&id).await?;
            let older = ParentRunOutcome::from_events(run, &events);
            let inherited: Vec<StepOutputHandle> = older.available_outputs.into_iter().collect();
            outcome.inherit_outputs(inherited);
            ancestor = older.run.parent_run_id;
        }
        Ok(outcome)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<PipelineRun> {
        self.runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| StepwiseError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Load a run and aggregate its events against its registered pipeline.
    pub async fn result_for_run(&self, run_id: &str) -> Result<ResultView> {
        let run = self.get_run(run_id).await?;
        let definition = self.pipeline(&run.pipeline_name)?;
        let events = self.runs.get_run_events(run_id).await?;
        ResultView::for_run(&run, events, definition)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigField, ConfigType};
    use crate::definition::NodeDefinition;
    use crate::events::{FailureData, StepEvent, StepEventData};
    use crate::run_store::MemoryRunStore;
    use serde_json::json;

    fn pipeline() -> PipelineDefinition {
        PipelineDefinition::new(
            "etl",
            vec![
                NodeDefinition::leaf("extract")
                    .with_config(ConfigField::required(ConfigType::String)),
                NodeDefinition::leaf("transform").with_input("rows", "extract"),
                NodeDefinition::leaf("load").with_input("rows", "transform"),
            ],
        )
        .with_tag("team", "x")
    }

    fn config() -> serde_json::Value {
        json!({"solids": {"extract": {"config": "s3://bucket"}}})
    }

    fn coordinator() -> RunCoordinator {
        let mut coordinator = RunCoordinator::new(Arc::new(MemoryRunStore::new()));
        coordinator.register_pipeline(pipeline());
        coordinator
    }

    async fn record(coordinator: &RunCoordinator, run: &PipelineRun, key: &str, data: StepEventData) {
        let step = run.execution_plan.step(key).unwrap();
        coordinator
            .runs()
            .append_event(&run.run_id, StepEvent::for_step(step, data))
            .await
            .unwrap();
    }

    fn output(key: &str) -> StepEventData {
        StepEventData::Output {
            output: StepOutputHandle::new(key, "result"),
        }
    }

    #[tokio::test]
    async fn creates_full_run_with_generated_id() {
        let coordinator = coordinator();
        let run = coordinator
            .create_run(RunRequest::new("etl").with_config(config()))
            .await
            .unwrap();

        assert!(uuid::Uuid::parse_str(&run.run_id).is_ok());
        assert_eq!(run.status, RunStatus::NotStarted);
        assert!(run.step_keys_to_execute.is_none());
        assert_eq!(run.execution_plan.steps.len(), 3);
        assert!(coordinator.runs().get_run(&run.run_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalid_config_reports_every_violation_and_persists_nothing() {
        let coordinator = coordinator();
        let err = coordinator
            .create_run(
                RunRequest::new("etl")
                    .with_config(json!({"solids": {"extract": {"config": 3}, "bogus": {}}})),
            )
            .await
            .unwrap_err();
        match err {
            StepwiseError::InvalidConfig { violations, .. } => assert_eq!(violations.len(), 2),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
        assert!(coordinator.runs().all_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolve_subset_previews_without_persisting() {
        let coordinator = coordinator();
        let subset = coordinator
            .resolve_subset(
                &RunRequest::new("etl")
                    .with_config(config())
                    .with_node_selection(["transform"]),
            )
            .await
            .unwrap();
        assert!(!subset.is_full);
        assert_eq!(subset.step_keys, vec!["extract.compute", "transform.compute"]);
        assert!(coordinator.runs().all_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_pipeline_is_reported() {
        let err = coordinator()
            .create_run(RunRequest::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, StepwiseError::PipelineNotFound { .. }));
    }

    #[tokio::test]
    async fn tags_merge_with_run_tags_winning() {
        let run = coordinator()
            .create_run(
                RunRequest::new("etl")
                    .with_config(config())
                    .with_tag("team", "y")
                    .with_tag("env", "prod"),
            )
            .await
            .unwrap();
        assert_eq!(run.tags.len(), 2);
        assert_eq!(run.tags["team"], "y");
        assert_eq!(run.tags["env"], "prod");
    }

    #[tokio::test]
    async fn duplicate_run_id_is_rejected() {
        let coordinator = coordinator();
        let req = RunRequest::new("etl").with_config(config()).with_run_id("r1");
        coordinator.create_run(req.clone()).await.unwrap();
        let err = coordinator.create_run(req).await.unwrap_err();
        assert!(matches!(err, StepwiseError::RunAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn retry_chain_keeps_root_and_checkpointed_outputs() {
        let coordinator = coordinator();
        let r0 = coordinator
            .create_run(RunRequest::new("etl").with_config(config()).with_run_id("r0"))
            .await
            .unwrap();
        record(&coordinator, &r0, "extract.compute", output("extract.compute")).await;
        record(&coordinator, &r0, "extract.compute", StepEventData::Success { duration_ms: 5 }).await;
        let failure = StepEventData::Failure {
            error: FailureData::new("bad row"),
        };
        record(&coordinator, &r0, "transform.compute", failure).await;

        let r1 = coordinator
            .create_run(
                RunRequest::new("etl")
                    .with_config(config())
                    .retry_of("r0")
                    .with_run_id("r1"),
            )
            .await
            .unwrap();
        assert_eq!(
            r1.step_keys_to_execute,
            Some(vec!["transform.compute".to_string(), "load.compute".to_string()])
        );
        assert_eq!(r1.root_run_id.as_deref(), Some("r0"));
        assert_eq!(r1.parent_run_id.as_deref(), Some("r0"));

        record(&coordinator, &r1, "transform.compute", StepEventData::Success { duration_ms: 1 }).await;
        record(&coordinator, &r1, "load.compute", StepEventData::Skipped).await;

        // extract's output comes from r0, two generations back
        let r2 = coordinator
            .create_run(RunRequest::new("etl").with_config(config()).retry_of("r1"))
            .await
            .unwrap_err();
        assert!(matches!(r2, StepwiseError::PlanBuild { .. }));

        record(&coordinator, &r1, "transform.compute", output("transform.compute")).await;
        let r2 = coordinator
            .create_run(RunRequest::new("etl").with_config(config()).retry_of("r1"))
            .await
            .unwrap();
        assert_eq!(r2.step_keys_to_execute, Some(vec!["load.compute".to_string()]));
        assert_eq!(r2.root_run_id.as_deref(), Some("r0"));
        assert_eq!(r2.parent_run_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn retry_of_missing_parent_is_run_not_found() {
        let err = coordinator()
            .create_run(RunRequest::new("etl").with_config(config()).retry_of("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, StepwiseError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn explicit_root_run_id_wins() {
        let coordinator = coordinator();
        let r0 = coordinator
            .create_run(RunRequest::new("etl").with_config(config()))
            .await
            .unwrap();
        let run = coordinator
            .create_run(
                RunRequest::new("etl")
                    .with_config(config())
                    .retry_of(r0.run_id.clone())
                    .with_root_run_id("origin"),
            )
            .await
            .unwrap();
        assert_eq!(run.root_run_id.as_deref(), Some("origin"));
    }
}
