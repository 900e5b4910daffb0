//! Durable run records and their append-only event logs.
//!
//! [`MemoryRunStore`] keeps everything in process; [`FsRunStore`] keeps one
//! directory per run holding `run.json` and `events.jsonl`. In both, `create` is
//! all-or-nothing: a failed create leaves no run behind for readers to find.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use stepwise_types::{Result, RunStatus, StepwiseError};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::events::{EventBroadcaster, StepEvent};
use crate::run::PipelineRun;

const RUN_FILE: &str = "run.json";
const EVENTS_FILE: &str = "events.jsonl";

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a new run. Fails with `RunAlreadyExists` if the id is taken.
    async fn create(&self, run: PipelineRun) -> Result<PipelineRun>;

    async fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>>;

    /// Events of a run in append order.
    async fn get_run_events(&self, run_id: &str) -> Result<Vec<StepEvent>>;

    async fn append_event(&self, run_id: &str, event: StepEvent) -> Result<()>;

    /// Move a run forward. Backward transitions are rejected.
    async fn update_status(&self, run_id: &str, status: RunStatus) -> Result<PipelineRun>;

    /// Every run, oldest first.
    async fn all_runs(&self) -> Result<Vec<PipelineRun>>;
}

fn check_transition(run: &PipelineRun, status: RunStatus) -> Result<()> {
    if run.status.can_transition_to(status) {
        Ok(())
    } else {
        Err(StepwiseError::InvalidStatusTransition {
            run_id: run.run_id.clone(),
            from: run.status,
            to: status,
        })
    }
}

fn not_found(run_id: &str) -> StepwiseError {
    StepwiseError::RunNotFound {
        run_id: run_id.to_string(),
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    runs: BTreeMap<String, PipelineRun>,
    events: BTreeMap<String, Vec<StepEvent>>,
}

#[derive(Clone, Default)]
pub struct MemoryRunStore {
    state: Arc<RwLock<MemoryState>>,
    broadcaster: Option<EventBroadcaster>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish every appended event on `broadcaster`.
    pub fn with_broadcaster(mut self, broadcaster: EventBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, run: PipelineRun) -> Result<PipelineRun> {
        let mut state = self.state.write().await;
        if state.runs.contains_key(&run.run_id) {
            return Err(StepwiseError::RunAlreadyExists { run_id: run.run_id });
        }
        state.events.insert(run.run_id.clone(), Vec::new());
        state.runs.insert(run.run_id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        Ok(self.state.read().await.runs.get(run_id).cloned())
    }

    async fn get_run_events(&self, run_id: &str) -> Result<Vec<StepEvent>> {
        self.state
            .read()
            .await
            .events
            .get(run_id)
            .cloned()
            .ok_or_else(|| not_found(run_id))
    }

    async fn append_event(&self, run_id: &str, event: StepEvent) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let log = state.events.get_mut(run_id).ok_or_else(|| not_found(run_id))?;
            log.push(event.clone());
        }
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.publish(run_id, event);
        }
        Ok(())
    }

    async fn update_status(&self, run_id: &str, status: RunStatus) -> Result<PipelineRun> {
        let mut state = self.state.write().await;
        let run = state.runs.get_mut(run_id).ok_or_else(|| not_found(run_id))?;
        check_transition(run, status)?;
        run.status = status;
        Ok(run.clone())
    }

    async fn all_runs(&self) -> Result<Vec<PipelineRun>> {
        let mut runs: Vec<_> = self.state.read().await.runs.values().cloned().collect();
        runs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

/// One directory per run under `root`.
pub struct FsRunStore {
    root: PathBuf,
    // serializes writers within this process
    write_lock: Mutex<()>,
}

impl FsRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    async fn write_run(&self, run: &PipelineRun) -> Result<()> {
        let path = self.run_dir(&run.run_id).join(RUN_FILE);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(run)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(path = %path.display(), status = %run.status, "Run record saved");
        Ok(())
    }

    async fn read_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        let path = self.run_dir(run_id).join(RUN_FILE);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    async fn create_inner(&self, run: &PipelineRun) -> Result<()> {
        let dir = self.run_dir(&run.run_id);
        tokio::fs::File::create(dir.join(EVENTS_FILE)).await?;
        self.write_run(run).await
    }
}

/// Parse `events.jsonl`. A last line without its newline is an append still
/// in progress and is left for the next read.
fn parse_event_log(raw: &str) -> serde_json::Result<Vec<StepEvent>> {
    let complete = match raw.rfind('\n') {
        Some(end) => &raw[..end],
        None => "",
    };
    complete
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}

#[async_trait]
impl RunStore for FsRunStore {
    async fn create(&self, run: PipelineRun) -> Result<PipelineRun> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.root).await?;
        let dir = self.run_dir(&run.run_id);
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StepwiseError::RunAlreadyExists { run_id: run.run_id });
            }
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.create_inner(&run).await {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        self.read_run(run_id).await
    }

    async fn get_run_events(&self, run_id: &str) -> Result<Vec<StepEvent>> {
        if self.read_run(run_id).await?.is_none() {
            return Err(not_found(run_id));
        }
        let path = self.run_dir(run_id).join(EVENTS_FILE);
        let raw = tokio::fs::read_to_string(&path).await?;
        Ok(parse_event_log(&raw)?)
    }

    async fn append_event(&self, run_id: &str, event: StepEvent) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.read_run(run_id).await?.is_none() {
            return Err(not_found(run_id));
        }
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(self.run_dir(run_id).join(EVENTS_FILE))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn update_status(&self, run_id: &str, status: RunStatus) -> Result<PipelineRun> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.read_run(run_id).await?.ok_or_else(|| not_found(run_id))?;
        check_transition(&run, status)?;
        run.status = status;
        self.write_run(&run).await?;
        Ok(run)
    }

    async fn all_runs(&self) -> Result<Vec<PipelineRun>> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().to_string();
            if let Some(run) = self.read_run(&run_id).await? {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{NodeDefinition, PipelineDefinition};
    use crate::events::{StepEventData, StepKind};
    use crate::handle::NodeHandle;

    fn run(run_id: &str) -> PipelineRun {
        let plan = PipelineDefinition::new("p", vec![NodeDefinition::leaf("a")])
            .execution_plan()
            .unwrap();
        PipelineRun {
            run_id: run_id.into(),
            pipeline_name: "p".into(),
            status: RunStatus::NotStarted,
            step_keys_to_execute: None,
            node_selection: None,
            run_config: serde_json::Value::Null,
            mode: "default".into(),
            tags: BTreeMap::new(),
            root_run_id: None,
            parent_run_id: None,
            execution_plan: plan,
            created_at: chrono::Utc::now(),
        }
    }

    fn success() -> StepEvent {
        StepEvent::new(
            "a.compute",
            NodeHandle::parse("a").unwrap(),
            StepKind::Compute,
            StepEventData::Success { duration_ms: 1 },
        )
    }

    async fn exercise(store: &dyn RunStore) {
        store.create(run("r1")).await.unwrap();
        let dup = store.create(run("r1")).await.unwrap_err();
        assert!(matches!(dup, StepwiseError::RunAlreadyExists { .. }));

        assert!(store.get_run_events("r1").await.unwrap().is_empty());
        store.append_event("r1", success()).await.unwrap();
        let events = store.get_run_events("r1").await.unwrap();
        assert_eq!(events, vec![success()]);

        let missing = store.append_event("nope", success()).await.unwrap_err();
        assert!(matches!(missing, StepwiseError::RunNotFound { .. }));
        assert!(store.get_run("nope").await.unwrap().is_none());

        store.update_status("r1", RunStatus::Started).await.unwrap();
        let done = store.update_status("r1", RunStatus::Success).await.unwrap();
        assert_eq!(done.status, RunStatus::Success);
        let back = store
            .update_status("r1", RunStatus::Started)
            .await
            .unwrap_err();
        assert!(matches!(back, StepwiseError::InvalidStatusTransition { .. }));
        assert_eq!(
            store.get_run("r1").await.unwrap().unwrap().status,
            RunStatus::Success
        );

        store.create(run("r2")).await.unwrap();
        let ids: Vec<_> = store
            .all_runs()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryRunStore::new()).await;
    }

    #[tokio::test]
    async fn fs_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FsRunStore::new(dir.path().join("runs"))).await;
    }

    #[tokio::test]
    async fn fs_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsRunStore::new(dir.path());
            store.create(run("r1")).await.unwrap();
            store.append_event("r1", success()).await.unwrap();
        }
        let reopened = FsRunStore::new(dir.path());
        let loaded = reopened.get_run("r1").await.unwrap().unwrap();
        assert_eq!(loaded.pipeline_name, "p");
        assert_eq!(reopened.get_run_events("r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fs_store_ignores_partially_appended_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        store.create(run("r1")).await.unwrap();
        store.append_event("r1", success()).await.unwrap();

        let path = dir.path().join("r1").join(EVENTS_FILE);
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(br#"{"step_key": "a.comp"#).await.unwrap();
        file.flush().await.unwrap();

        assert_eq!(store.get_run_events("r1").await.unwrap().len(), 1);
    }

    #[test]
    fn event_log_without_trailing_newline_keeps_complete_lines() {
        assert!(parse_event_log("").unwrap().is_empty());
        assert!(parse_event_log("{\"half").unwrap().is_empty());
        assert!(parse_event_log("not json\n").is_err());
    }

    #[tokio::test]
    async fn memory_store_broadcasts_appended_events() {
        let broadcaster = EventBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        let store = MemoryRunStore::new().with_broadcaster(broadcaster);
        store.create(run("r1")).await.unwrap();
        store.append_event("r1", success()).await.unwrap();

        let logged = rx.recv().await.unwrap();
        assert_eq!(logged.run_id, "r1");
        assert_eq!(logged.event.step_key, "a.compute");
    }
}
