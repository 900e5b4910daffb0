//! CLI binary for creating, resuming, and inspecting stepwise runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use stepwise_pipeline::{
    ConfigValidator, FsIntermediateStore, FsRunStore, IntermediateStore, NodeResultView,
    OutputValue, PipelineDefinition, RunCoordinator, RunRequest, RunStore, SchemaConfigValidator,
    StepEvent, StepOutputHandle, StoreContextFactory,
};
use stepwise_types::RunStatus;

#[derive(Parser)]
#[command(name = "stepwise", version, about = "Resumable DAG pipeline runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the run store and intermediates
    #[arg(long, global = true, default_value = ".stepwise")]
    root: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a pipeline definition and its execution plan
    List {
        /// Path to the pipeline .json file
        pipeline: PathBuf,
    },

    /// Validate a run config against a pipeline
    Validate {
        /// Path to the pipeline .json file
        pipeline: PathBuf,

        /// Path to the run config .json file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Mode to validate against
        #[arg(short, long, default_value = "default")]
        mode: String,
    },

    /// Print the step subset a run request would execute, without persisting it
    Plan {
        /// Path to the pipeline .json file
        pipeline: PathBuf,

        #[command(flatten)]
        request: RequestArgs,
    },

    /// Create a run (fresh, subset, or retry) in the run store
    CreateRun {
        /// Path to the pipeline .json file
        pipeline: PathBuf,

        #[command(flatten)]
        request: RequestArgs,
    },

    /// Append step events (one JSON object per line) to a run's log
    Record {
        run_id: String,

        /// Path to a .jsonl file of step events
        events: PathBuf,

        /// Status to move the run to after appending
        #[arg(long, value_parser = parse_status)]
        status: Option<RunStatus>,
    },

    /// Write a step output value into the intermediate store
    Put {
        run_id: String,

        /// Step key that produced the value
        step_key: String,

        /// JSON value to store
        value: String,

        /// Output name
        #[arg(short, long, default_value = "result")]
        output: String,
    },

    /// Show the reconstructed result of a run, or of one node in it
    Result {
        /// Path to the pipeline .json file
        pipeline: PathBuf,

        run_id: String,

        /// Dotted node handle, e.g. `outer.inner`
        handle: Option<String>,

        /// Output to read back (requires a handle)
        #[arg(short, long, requires = "handle")]
        output: Option<String>,
    },

    /// List persisted runs
    Runs,
}

#[derive(clap::Args)]
struct RequestArgs {
    /// Path to the run config .json file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value = "default")]
    mode: String,

    /// Node names to select (comma separated)
    #[arg(long, value_delimiter = ',')]
    nodes: Vec<String>,

    /// Step selection queries such as `+b.compute*` (comma separated)
    #[arg(long, value_delimiter = ',')]
    steps: Vec<String>,

    /// Resume from this parent run
    #[arg(long)]
    parent: Option<String>,

    #[arg(long)]
    root_run_id: Option<String>,

    #[arg(long)]
    run_id: Option<String>,

    /// Run tags as key=value
    #[arg(long = "tag", value_parser = parse_tag)]
    tags: Vec<(String, String)>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let root = cli.root;
    tracing::debug!(root = %root.display(), "Using store root");
    match cli.command {
        Commands::List { pipeline } => {
            cmd_list(&pipeline)?;
        }
        Commands::Validate {
            pipeline,
            config,
            mode,
        } => {
            cmd_validate(&pipeline, config.as_deref(), &mode)?;
        }
        Commands::Plan { pipeline, request } => {
            cmd_plan(&root, &pipeline, request).await?;
        }
        Commands::CreateRun { pipeline, request } => {
            cmd_create_run(&root, &pipeline, request).await?;
        }
        Commands::Record {
            run_id,
            events,
            status,
        } => {
            cmd_record(&root, &run_id, &events, status).await?;
        }
        Commands::Put {
            run_id,
            step_key,
            value,
            output,
        } => {
            cmd_put(&root, &run_id, &step_key, &output, &value).await?;
        }
        Commands::Result {
            pipeline,
            run_id,
            handle,
            output,
        } => {
            cmd_result(&root, &pipeline, &run_id, handle.as_deref(), output.as_deref()).await?;
        }
        Commands::Runs => {
            cmd_runs(&root).await?;
        }
    }

    Ok(())
}

fn parse_tag(text: &str) -> Result<(String, String), String> {
    match text.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{text}'")),
    }
}

fn parse_status(text: &str) -> Result<RunStatus, String> {
    let normalized = text.to_ascii_lowercase().replace('-', "_");
    serde_json::from_value(serde_json::Value::String(normalized))
        .map_err(|_| format!("unknown run status '{text}'"))
}

fn load_pipeline(path: &Path) -> anyhow::Result<PipelineDefinition> {
    PipelineDefinition::load(path)
        .with_context(|| format!("loading pipeline {}", path.display()))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<serde_json::Value> {
    let Some(path) = path else {
        return Ok(serde_json::json!({}));
    };
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading run config {}", path.display()))?;
    Ok(serde_json::from_str(&source)?)
}

fn run_store(root: &Path) -> Arc<dyn RunStore> {
    Arc::new(FsRunStore::new(root.join("runs")))
}

fn intermediates(root: &Path) -> Arc<dyn IntermediateStore> {
    Arc::new(FsIntermediateStore::new(root.join("intermediates")))
}

fn coordinator(root: &Path, definition: PipelineDefinition) -> RunCoordinator {
    let mut coordinator = RunCoordinator::new(run_store(root));
    coordinator.register_pipeline(definition);
    coordinator
}

fn build_request(name: &str, args: RequestArgs) -> anyhow::Result<RunRequest> {
    let mut request = RunRequest::new(name)
        .with_config(load_config(args.config.as_deref())?)
        .with_mode(args.mode);
    if !args.nodes.is_empty() {
        request = request.with_node_selection(args.nodes);
    }
    if !args.steps.is_empty() {
        request = request.with_step_selection(args.steps);
    }
    if let Some(parent) = args.parent {
        request = request.retry_of(parent);
    }
    if let Some(root_run_id) = args.root_run_id {
        request = request.with_root_run_id(root_run_id);
    }
    if let Some(run_id) = args.run_id {
        request = request.with_run_id(run_id);
    }
    for (key, value) in args.tags {
        request = request.with_tag(key, value);
    }
    Ok(request)
}

fn cmd_list(path: &Path) -> anyhow::Result<()> {
    let definition = load_pipeline(path)?;
    let plan = definition.execution_plan()?;

    println!("Pipeline: {}", definition.name);
    if let Some(description) = &definition.description {
        println!("Description: {}", description);
    }
    println!("Modes: {}", definition.modes.join(", "));

    println!("\nSolids:");
    for (handle, node) in definition.leaves()? {
        let outputs: Vec<&str> = node.outputs.iter().map(|o| o.name.as_str()).collect();
        println!("  {} -> [{}]", handle, outputs.join(", "));
    }

    println!("\nSteps:");
    for step in &plan.steps {
        let upstream: Vec<String> = step.upstream_keys().into_iter().collect();
        if upstream.is_empty() {
            println!("  {}", step.key);
        } else {
            println!("  {} <- {}", step.key, upstream.join(", "));
        }
    }
    Ok(())
}

fn cmd_validate(path: &Path, config: Option<&Path>, mode: &str) -> anyhow::Result<()> {
    let definition = load_pipeline(path)?;
    let config = load_config(config)?;
    let violations = SchemaConfigValidator.validate(&definition, mode, &config);

    if violations.is_empty() {
        println!("Config is valid");
        return Ok(());
    }

    for violation in &violations {
        println!("[ERROR] {}: {}", violation.path, violation.message);
    }
    std::process::exit(1);
}

async fn cmd_plan(root: &Path, path: &Path, args: RequestArgs) -> anyhow::Result<()> {
    let definition = load_pipeline(path)?;
    let name = definition.name.clone();
    let coordinator = coordinator(root, definition);
    let request = build_request(&name, args)?;

    let subset = coordinator.resolve_subset(&request).await?;
    if subset.is_full {
        println!("Full pipeline ({} steps):", subset.step_keys.len());
    } else {
        println!("Subset ({} steps):", subset.step_keys.len());
    }
    for key in &subset.step_keys {
        println!("  {}", key);
    }
    Ok(())
}

async fn cmd_create_run(root: &Path, path: &Path, args: RequestArgs) -> anyhow::Result<()> {
    let definition = load_pipeline(path)?;
    let name = definition.name.clone();
    let coordinator = coordinator(root, definition);
    let request = build_request(&name, args)?;

    let run = coordinator.create_run(request).await?;
    println!("Run: {}", run.run_id);
    println!("Pipeline: {}", run.pipeline_name);
    println!("Status: {}", run.status);
    if let Some(parent) = &run.parent_run_id {
        println!("Parent: {}", parent);
    }
    if let Some(root_run_id) = &run.root_run_id {
        println!("Root: {}", root_run_id);
    }
    match &run.step_keys_to_execute {
        Some(keys) => println!("Steps: {}", keys.join(", ")),
        None => println!("Steps: (all)"),
    }
    Ok(())
}

async fn cmd_record(
    root: &Path,
    run_id: &str,
    events: &Path,
    status: Option<RunStatus>,
) -> anyhow::Result<()> {
    let runs = run_store(root);
    let source = std::fs::read_to_string(events)
        .with_context(|| format!("reading events {}", events.display()))?;

    let mut count = 0;
    for (lineno, line) in source.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: StepEvent = serde_json::from_str(line)
            .with_context(|| format!("{}:{}", events.display(), lineno + 1))?;
        runs.append_event(run_id, event).await?;
        count += 1;
    }
    println!("Recorded {} events for run {}", count, run_id);

    if let Some(status) = status {
        let run = runs.update_status(run_id, status).await?;
        println!("Status: {}", run.status);
    }
    Ok(())
}

async fn cmd_put(
    root: &Path,
    run_id: &str,
    step_key: &str,
    output: &str,
    value: &str,
) -> anyhow::Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(value).context("value must be valid JSON")?;
    let handle = StepOutputHandle::new(step_key, output);
    intermediates(root).put(run_id, &handle, value).await?;
    println!("Stored {} for run {}", handle, run_id);
    Ok(())
}

async fn cmd_result(
    root: &Path,
    path: &Path,
    run_id: &str,
    handle: Option<&str>,
    output: Option<&str>,
) -> anyhow::Result<()> {
    let definition = load_pipeline(path)?;
    let coordinator = coordinator(root, definition);
    let view = coordinator.result_for_run(run_id).await?;
    let contexts = StoreContextFactory::new(intermediates(root));

    let Some(handle) = handle else {
        println!("Run: {}", view.run_id());
        println!("Success: {}", view.success());
        println!("\nNodes:");
        for node in view.node_result_list()? {
            println!("  {} {}", node.handle(), node_state(&node));
        }
        return Ok(());
    };

    let node = view.result_for_handle(handle)?;
    println!("Node: {} {}", node.handle(), node_state(&node));
    if let Some(failure) = node.failure_data()? {
        println!("Failure: {}", failure.message);
    }

    match output {
        Some(name) => match node.output_value(&contexts, name).await? {
            OutputValue::Value(value) => println!("{} = {}", name, value),
            OutputValue::NoValue => println!("{} = (no value)", name),
        },
        None => {
            if let Some(values) = node.output_values(&contexts).await? {
                for (name, value) in values {
                    println!("{} = {}", name, value);
                }
            }
        }
    }
    Ok(())
}

fn node_state(node: &NodeResultView<'_>) -> &'static str {
    if node.success() {
        "success"
    } else if !node.failures().is_empty() {
        "failure"
    } else if node.compute_step_events().is_empty() {
        "not executed"
    } else if node.skipped() {
        "skipped"
    } else {
        "incomplete"
    }
}

async fn cmd_runs(root: &Path) -> anyhow::Result<()> {
    let runs = run_store(root).all_runs().await?;
    if runs.is_empty() {
        println!("No runs");
        return Ok(());
    }
    for run in runs {
        let lineage = match &run.parent_run_id {
            Some(parent) => format!(" (retry of {})", parent),
            None => String::new(),
        };
        println!(
            "{} {} {} {}{}",
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            run.run_id,
            run.pipeline_name,
            run.status,
            lineage
        );
    }
    Ok(())
}
