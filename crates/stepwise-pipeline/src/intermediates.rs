//! Checkpointed step outputs and the scoped contexts used to read them back.
//!
//! An [`IntermediateStore`] keeps the value of every `(run, step, output)` that a
//! step reported through a `STEP_OUTPUT` event. Reads happen through an
//! [`ExecutionContext`] obtained from a [`ContextFactory`]; the context is
//! released when it is dropped, so every exit path of a read gives it back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_types::{Result, StepwiseError};
use tokio::sync::RwLock;

use crate::definition::ValueType;
use crate::events::StepOutputHandle;

// ---------------------------------------------------------------------------
// Stored values
// ---------------------------------------------------------------------------

/// Pointer wrapper a store may hand back instead of the bare value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStoreOperation {
    /// Where the object lives in the backing store.
    pub key: String,
    pub obj: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Value(Value),
    Pointer(ObjectStoreOperation),
}

impl StoredValue {
    /// The payload, dereferencing a pointer exactly once.
    pub fn into_value(self) -> Value {
        match self {
            StoredValue::Value(v) => v,
            StoredValue::Pointer(op) => op.obj,
        }
    }

    fn payload(&self) -> &Value {
        match self {
            StoredValue::Value(v) => v,
            StoredValue::Pointer(op) => &op.obj,
        }
    }
}

fn check_type(handle: &StepOutputHandle, expected: ValueType, stored: &StoredValue) -> Result<()> {
    if expected.accepts(stored.payload()) {
        Ok(())
    } else {
        Err(StepwiseError::store(format!(
            "checkpoint {} does not hold a valid {}",
            handle, expected
        )))
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IntermediateStore: Send + Sync {
    /// Read the checkpoint for `handle` in the context's run.
    async fn get(
        &self,
        handle: &StepOutputHandle,
        expected: ValueType,
        context: &ExecutionContext,
    ) -> Result<StoredValue>;

    async fn put(&self, run_id: &str, handle: &StepOutputHandle, value: Value) -> Result<()>;

    async fn has(&self, run_id: &str, handle: &StepOutputHandle) -> Result<bool>;
}

/// In-process store keyed by run id and output handle.
#[derive(Default)]
pub struct MemoryIntermediateStore {
    values: RwLock<HashMap<(String, StepOutputHandle), Value>>,
}

impl MemoryIntermediateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntermediateStore for MemoryIntermediateStore {
    async fn get(
        &self,
        handle: &StepOutputHandle,
        expected: ValueType,
        context: &ExecutionContext,
    ) -> Result<StoredValue> {
        let values = self.values.read().await;
        let value = values
            .get(&(context.run_id().to_string(), handle.clone()))
            .cloned()
            .ok_or_else(|| {
                StepwiseError::store(format!(
                    "no checkpoint for {} in run '{}'",
                    handle,
                    context.run_id()
                ))
            })?;
        let stored = StoredValue::Value(value);
        check_type(handle, expected, &stored)?;
        Ok(stored)
    }

    async fn put(&self, run_id: &str, handle: &StepOutputHandle, value: Value) -> Result<()> {
        self.values
            .write()
            .await
            .insert((run_id.to_string(), handle.clone()), value);
        Ok(())
    }

    async fn has(&self, run_id: &str, handle: &StepOutputHandle) -> Result<bool> {
        Ok(self
            .values
            .read()
            .await
            .contains_key(&(run_id.to_string(), handle.clone())))
    }
}

/// Store laid out as `<root>/<run_id>/<step_key>/<output>.json`.
///
/// Reads come back as [`StoredValue::Pointer`] carrying the file path.
pub struct FsIntermediateStore {
    root: PathBuf,
}

impl FsIntermediateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, run_id: &str, handle: &StepOutputHandle) -> PathBuf {
        self.root
            .join(run_id)
            .join(&handle.step_key)
            .join(format!("{}.json", handle.output_name))
    }
}

#[async_trait]
impl IntermediateStore for FsIntermediateStore {
    async fn get(
        &self,
        handle: &StepOutputHandle,
        expected: ValueType,
        context: &ExecutionContext,
    ) -> Result<StoredValue> {
        let path = self.path_for(context.run_id(), handle);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StepwiseError::store(format!(
                    "no checkpoint for {} in run '{}' at {}",
                    handle,
                    context.run_id(),
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let obj: Value = serde_json::from_str(&json)?;
        tracing::debug!(path = %path.display(), output = %handle, "Checkpoint read");
        let stored = StoredValue::Pointer(ObjectStoreOperation {
            key: path.display().to_string(),
            obj,
        });
        check_type(handle, expected, &stored)?;
        Ok(stored)
    }

    async fn put(&self, run_id: &str, handle: &StepOutputHandle, value: Value) -> Result<()> {
        let path = self.path_for(run_id, handle);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_string_pretty(&value)?;
        tokio::fs::write(&path, json).await?;
        tracing::debug!(path = %path.display(), output = %handle, "Checkpoint saved");
        Ok(())
    }

    async fn has(&self, run_id: &str, handle: &StepOutputHandle) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(run_id, handle)).await?)
    }
}

// ---------------------------------------------------------------------------
// Execution contexts
// ---------------------------------------------------------------------------

type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;

/// Short-lived handle to the resources needed to read a run's checkpoints.
///
/// The release callback runs exactly once, when the context is dropped.
pub struct ExecutionContext {
    run_id: String,
    intermediates: Arc<dyn IntermediateStore>,
    on_release: Option<ReleaseFn>,
}

impl ExecutionContext {
    pub fn new(run_id: impl Into<String>, intermediates: Arc<dyn IntermediateStore>) -> Self {
        Self {
            run_id: run_id.into(),
            intermediates,
            on_release: None,
        }
    }

    pub fn on_release(mut self, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(release));
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Read one checkpointed output, unwrapping a pointer if the store returns one.
    pub async fn read_output(
        &self,
        handle: &StepOutputHandle,
        expected: ValueType,
    ) -> Result<Value> {
        let stored = self.intermediates.get(handle, expected, self).await?;
        Ok(stored.into_value())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn acquire(&self, run_id: &str) -> Result<ExecutionContext>;
}

/// Hands out contexts over one store and counts them in and out.
#[derive(Clone)]
pub struct StoreContextFactory {
    intermediates: Arc<dyn IntermediateStore>,
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl StoreContextFactory {
    pub fn new(intermediates: Arc<dyn IntermediateStore>) -> Self {
        Self {
            intermediates,
            acquired: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Contexts handed out and not yet dropped.
    pub fn active_contexts(&self) -> usize {
        let released = self.released.load(Ordering::SeqCst);
        self.acquired().saturating_sub(released)
    }
}

#[async_trait]
impl ContextFactory for StoreContextFactory {
    async fn acquire(&self, run_id: &str) -> Result<ExecutionContext> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let released = Arc::clone(&self.released);
        tracing::debug!(run_id, "Execution context acquired");
        Ok(
            ExecutionContext::new(run_id, Arc::clone(&self.intermediates)).on_release(move || {
                released.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
