//! Run resumption and result reconstruction for DAG pipelines.
//!
//! This crate implements the stepwise core: hierarchical node handles, pipeline
//! definitions and plan snapshots, config validation, step-subset resolution for
//! fresh, selected, and retried runs, run creation, and the event-sourced result
//! views that read step outputs back from the intermediate store.

pub mod config;
pub mod definition;
pub mod events;
pub mod handle;
pub mod intermediates;
pub mod lifecycle;
pub mod plan;
pub mod results;
pub mod run;
pub mod run_store;
pub mod selection;
pub mod subset;

pub use config::{ConfigField, ConfigType, ConfigValidator, SchemaConfigValidator};
pub use definition::{
    compute_step_key, input_thunk_step_key, ExecutionPlanSnapshot, ExecutionStep,
    InputDefinition, NodeDefinition, OutputDefinition, PipelineDefinition, StepInput, ValueType,
    DEFAULT_MODE, DEFAULT_OUTPUT,
};
pub use events::{
    EventBroadcaster, ExpectationResult, FailureData, LoggedEvent, Materialization, StepEvent,
    StepEventData, StepEventKind, StepKind, StepOutputHandle,
};
pub use handle::NodeHandle;
pub use intermediates::{
    ContextFactory, ExecutionContext, FsIntermediateStore, IntermediateStore,
    MemoryIntermediateStore, ObjectStoreOperation, StoreContextFactory, StoredValue,
};
pub use lifecycle::RunCoordinator;
pub use plan::{PlanBuilder, SubsetPlanBuilder};
pub use results::{aggregate, aggregate_for_run, NodeResultView, OutputValue, ResultView};
pub use run::{PipelineRun, RunRequest};
pub use run_store::{FsRunStore, MemoryRunStore, RunStore};
pub use selection::{parse_step_selection, StepDeps};
pub use subset::{resolve, ParentRunOutcome, StepSubset};
