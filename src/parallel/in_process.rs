//! Fixed-size pool of blocking worker threads inside this process

use super::task::execute;
use super::{BackendDescriptor, ExecutionBackend, TaskHandle, TaskPackage, TaskResult};
use crate::composite::Registry;
use crate::error::{LoopError, LoopResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

const BACKEND: &str = "in_process";

/// Runs task packages on tokio's blocking pool, at most `processes` at a time
///
/// Packages move into the worker and results move back out by value; no
/// state is shared between tasks.
pub struct InProcessBackend {
    processes: usize,
    registry: Arc<Registry>,
    slots: Arc<Semaphore>,
    running: JoinSet<(u64, LoopResult<TaskResult>)>,
    buffered: HashMap<u64, LoopResult<TaskResult>>,
}

impl InProcessBackend {
    pub fn new(processes: usize, registry: Arc<Registry>) -> Self {
        let processes = processes.max(1);
        Self {
            processes,
            registry,
            slots: Arc::new(Semaphore::new(processes)),
            running: JoinSet::new(),
            buffered: HashMap::new(),
        }
    }

    fn take_buffered(&mut self, pending: &[TaskHandle]) -> Option<LoopResult<TaskResult>> {
        pending
            .iter()
            .find_map(|handle| self.buffered.remove(&handle.task_id))
    }
}

#[async_trait]
impl ExecutionBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn begin(&mut self) -> LoopResult<()> {
        debug!("In-process pool with {} worker(s)", self.processes);
        Ok(())
    }

    /// Blocks until a worker slot is free
    async fn dispatch(&mut self, package: TaskPackage) -> LoopResult<TaskHandle> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| LoopError::backend_with_source(BACKEND, "worker pool is closed", e))?;

        let handle = package.handle();
        let registry = self.registry.clone();
        self.running.spawn_blocking(move || {
            let _permit = permit;
            let result = execute(&package, &registry);
            (package.task_id, result)
        });
        Ok(handle)
    }

    async fn next_completed(&mut self, pending: &[TaskHandle]) -> LoopResult<TaskResult> {
        if let Some(result) = self.take_buffered(pending) {
            return result;
        }

        while let Some(joined) = self.running.join_next().await {
            let (task_id, result) = joined
                .map_err(|e| LoopError::backend_with_source(BACKEND, "worker panicked", e))?;
            if pending.iter().any(|h| h.task_id == task_id) {
                return result;
            }
            self.buffered.insert(task_id, result);
        }

        Err(LoopError::backend(
            BACKEND,
            format!("none of {} awaited task(s) is running", pending.len()),
        ))
    }

    async fn terminate(&mut self) -> LoopResult<()> {
        self.slots.close();
        // Tasks already on a blocking thread run to completion detached;
        // their results are dropped.
        self.running.abort_all();
        Ok(())
    }

    async fn end(&mut self) -> LoopResult<()> {
        while let Some(joined) = self.running.join_next().await {
            match joined {
                Ok((task_id, Err(e))) => warn!("Uncollected task {} failed: {}", task_id, e),
                Ok((task_id, Ok(_))) => debug!("Uncollected task {} finished", task_id),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("Worker panicked: {}", e),
            }
        }
        self.slots.close();
        self.buffered.clear();
        Ok(())
    }

    fn descriptor(&self) -> Option<BackendDescriptor> {
        None
    }
}
