//! Reader that farms work units out through the Parallel Execution Facade
//!
//! `read` splits a unit into chunks and dispatches one task per chunk without
//! waiting. `end` collects every task, folds the outputs into the collectors
//! and the finished worker readers into the local readers in source order
//! (unit order, then chunk order) whatever order they completed in, and ends
//! the composite.

use super::{Checkpointable, PipelineState, UnitReader};
use crate::composite::{CompositeOutput, CompositeState, ReaderCollectorComposite, Registry};
use crate::error::{LoopError, LoopResult};
use crate::parallel::{
    BackendDescriptor, ParallelExecution, ProgressMonitor, SharedExecution, TaskHandle,
    TaskPackage,
};
use crate::subprocess::ProcessRunner;
use crate::unit::{SplitPolicy, WorkUnit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedTask {
    /// Position of the work unit in the source sequence
    pub unit_index: usize,
    pub handle: TaskHandle,
}

/// Serialized [`DispatchingReader`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchState {
    pub composite: CompositeState,
    pub policy: SplitPolicy,
    pub tasks: Vec<DispatchedTask>,
    pub units_read: usize,
    pub next_task_id: u64,
    pub backend: BackendDescriptor,
}

pub struct DispatchingReader {
    composite: ReaderCollectorComposite,
    policy: SplitPolicy,
    execution: SharedExecution,
    tasks: Vec<DispatchedTask>,
    units_read: usize,
    next_task_id: u64,
    ended: bool,
}

impl std::fmt::Debug for DispatchingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchingReader")
            .field("composite", &self.composite)
            .field("policy", &self.policy)
            .field("tasks", &self.tasks.len())
            .field("units_read", &self.units_read)
            .finish()
    }
}

impl DispatchingReader {
    pub fn new(
        composite: ReaderCollectorComposite,
        policy: SplitPolicy,
        execution: SharedExecution,
    ) -> Self {
        Self {
            composite,
            policy,
            execution,
            tasks: Vec::new(),
            units_read: 0,
            next_task_id: 0,
            ended: false,
        }
    }

    /// Rebuild from a checkpoint, re-attached to the backend that ran the tasks
    pub fn restore(
        state: &DispatchState,
        registry: &Registry,
        runner: Arc<dyn ProcessRunner>,
        progress: ProgressMonitor,
    ) -> LoopResult<Self> {
        let composite = ReaderCollectorComposite::restore(&state.composite, registry)?;
        let pending: Vec<TaskHandle> = state.tasks.iter().map(|t| t.handle.clone()).collect();
        let execution = ParallelExecution::attach(&state.backend, &pending, runner, progress)?;
        Ok(Self {
            composite,
            policy: state.policy,
            execution: execution.into_shared(),
            tasks: state.tasks.clone(),
            units_read: state.units_read,
            next_task_id: state.next_task_id,
            ended: false,
        })
    }

    pub fn execution(&self) -> &SharedExecution {
        &self.execution
    }

    pub fn tasks(&self) -> &[DispatchedTask] {
        &self.tasks
    }

    pub async fn snapshot(&self) -> LoopResult<DispatchState> {
        let backend = self.execution.lock().await.descriptor().ok_or_else(|| {
            LoopError::InvalidState {
                component: "dispatching reader",
                expected: "a backend whose tasks outlive this process",
                actual: "in-process backend".to_string(),
            }
        })?;
        Ok(DispatchState {
            composite: self.composite.snapshot()?,
            policy: self.policy,
            tasks: self.tasks.clone(),
            units_read: self.units_read,
            next_task_id: self.next_task_id,
            backend,
        })
    }
}

#[async_trait]
impl UnitReader for DispatchingReader {
    async fn begin(&mut self) -> LoopResult<()> {
        self.composite.begin()
    }

    async fn read(&mut self, unit: &WorkUnit) -> LoopResult<()> {
        let readers = self.composite.reader_states()?;
        let chunks = self.policy.split(unit);
        debug!("Work unit {} split into {} task(s)", unit.name, chunks.len());

        let mut execution = self.execution.lock().await;
        for chunk in chunks {
            let package = TaskPackage {
                task_id: self.next_task_id,
                unit: chunk,
                readers: readers.clone(),
            };
            let handle = execution.dispatch(package).await?;
            self.next_task_id += 1;
            self.tasks.push(DispatchedTask {
                unit_index: self.units_read,
                handle,
            });
        }
        self.units_read += 1;
        Ok(())
    }

    async fn end(&mut self) -> LoopResult<CompositeOutput> {
        if self.ended {
            return Err(LoopError::InvalidState {
                component: "dispatching reader",
                expected: "not yet ended",
                actual: "ended".to_string(),
            });
        }

        let handles: Vec<TaskHandle> = self.tasks.iter().map(|t| t.handle.clone()).collect();
        let mut results = self.execution.lock().await.collect(&handles).await?;
        info!(
            "Collected {} task(s) for {} work unit(s)",
            results.len(),
            self.units_read
        );

        for task in &self.tasks {
            let result = results.remove(&task.handle.task_id).ok_or_else(|| {
                LoopError::TaskFailed {
                    task_id: task.handle.task_id,
                    unit: task.handle.unit.clone(),
                    message: "no result collected".to_string(),
                }
            })?;
            self.composite
                .collect_outputs(&task.handle.unit, result.outputs)?;
            self.composite
                .merge_readers(&task.handle.unit, result.readers)?;
        }

        self.ended = true;
        self.composite.end()
    }
}

#[async_trait]
impl Checkpointable for DispatchingReader {
    async fn checkpoint_state(&mut self) -> LoopResult<PipelineState> {
        Ok(PipelineState::Dispatch(self.snapshot().await?))
    }
}
