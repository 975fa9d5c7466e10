//! Parallel Execution Facade
//!
//! [`ParallelExecution`] owns one [`ExecutionBackend`] and drives its
//! lifecycle: `begin`, any number of `dispatch`/`collect` rounds, an optional
//! `terminate`, and a final `end` that is safe from every state. The facade
//! also owns the run's [`ProgressMonitor`].

pub mod batch_queue;
pub mod in_process;
pub mod progress;
pub mod subprocess;
pub mod task;

pub use batch_queue::BatchQueueBackend;
pub use in_process::InProcessBackend;
pub use progress::{BarSink, NullSink, ProgressMonitor, ProgressReport, ProgressSink};
pub use subprocess::SubprocessBackend;
pub use task::{TaskHandle, TaskPackage, TaskResult};

use crate::composite::Registry;
use crate::config::RunConfig;
use crate::error::{LoopError, LoopResult};
use crate::subprocess::ProcessRunner;
use crate::working_area::WorkingArea;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Which backend executes the tasks of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelMode {
    #[default]
    InProcess,
    Subprocess,
    Htcondor,
}

impl ParallelMode {
    /// Whether tasks of this mode can outlive the dispatching process
    pub fn is_detached(&self) -> bool {
        !matches!(self, ParallelMode::InProcess)
    }
}

impl FromStr for ParallelMode {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_process" | "multiprocessing" => Ok(ParallelMode::InProcess),
            "subprocess" => Ok(ParallelMode::Subprocess),
            "htcondor" => Ok(ParallelMode::Htcondor),
            other => Err(LoopError::Config(format!("unknown parallel mode '{other}'"))),
        }
    }
}

impl std::fmt::Display for ParallelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParallelMode::InProcess => "in_process",
            ParallelMode::Subprocess => "subprocess",
            ParallelMode::Htcondor => "htcondor",
        };
        f.write_str(name)
    }
}

/// Everything a later process needs to re-attach to outstanding tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendDescriptor {
    Subprocess {
        working_area: PathBuf,
        worker_program: PathBuf,
        max_workers: Option<usize>,
        poll_interval_ms: u64,
        collect_timeout_secs: Option<u64>,
        /// Task id to worker pid, for workers still running at snapshot time
        #[serde(default)]
        workers: BTreeMap<u64, u32>,
    },
    Htcondor {
        working_area: PathBuf,
        worker_program: PathBuf,
        job_desc_extra: Vec<String>,
        poll_interval_ms: u64,
        collect_timeout_secs: Option<u64>,
        /// Task id to scheduler cluster id
        clusters: BTreeMap<u64, u64>,
    },
}

impl BackendDescriptor {
    pub fn mode(&self) -> ParallelMode {
        match self {
            BackendDescriptor::Subprocess { .. } => ParallelMode::Subprocess,
            BackendDescriptor::Htcondor { .. } => ParallelMode::Htcondor,
        }
    }

    pub fn working_area(&self) -> &std::path::Path {
        match self {
            BackendDescriptor::Subprocess { working_area, .. }
            | BackendDescriptor::Htcondor { working_area, .. } => working_area,
        }
    }
}

/// One way of running task packages
#[async_trait]
pub trait ExecutionBackend: Send {
    fn name(&self) -> &'static str;

    async fn begin(&mut self) -> LoopResult<()>;

    async fn dispatch(&mut self, package: TaskPackage) -> LoopResult<TaskHandle>;

    /// Wait for any task in `pending` to finish and return its result
    ///
    /// Results arrive in completion order, not dispatch order.
    async fn next_completed(&mut self, pending: &[TaskHandle]) -> LoopResult<TaskResult>;

    /// Kill every task still in flight
    async fn terminate(&mut self) -> LoopResult<()>;

    /// Wait for every dispatched task to be accounted for, then release resources
    async fn end(&mut self) -> LoopResult<()>;

    /// Re-attach descriptor, `None` for backends whose tasks die with this process
    fn descriptor(&self) -> Option<BackendDescriptor>;

    fn working_area(&self) -> Option<&WorkingArea> {
        None
    }
}

/// Lifecycle of the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Created,
    Running,
    Terminated,
    Ended,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Facade handle shared between the loop, the dispatching reader and the
/// interrupt handler
pub type SharedExecution = Arc<Mutex<ParallelExecution>>;

pub struct ParallelExecution {
    backend: Box<dyn ExecutionBackend>,
    state: ExecutionState,
    progress: ProgressMonitor,
    user_modules: Vec<PathBuf>,
    outstanding: HashSet<u64>,
}

impl std::fmt::Debug for ParallelExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecution")
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("progress", &self.progress.report())
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

impl ParallelExecution {
    pub fn new(backend: Box<dyn ExecutionBackend>, progress: ProgressMonitor) -> Self {
        Self {
            backend,
            state: ExecutionState::Created,
            progress,
            user_modules: Vec::new(),
            outstanding: HashSet::new(),
        }
    }

    /// Build the backend selected by `config`
    ///
    /// Detached backends get a fresh working area under the configured root.
    pub fn from_config(
        config: &RunConfig,
        registry: Arc<Registry>,
        runner: Arc<dyn ProcessRunner>,
        progress: ProgressMonitor,
    ) -> LoopResult<Self> {
        let backend: Box<dyn ExecutionBackend> = match config.parallel_mode {
            ParallelMode::InProcess => Box::new(InProcessBackend::new(config.processes, registry)),
            ParallelMode::Subprocess => {
                let area = WorkingArea::create(&config.working_area_root())?;
                Box::new(SubprocessBackend::new(
                    area,
                    config.worker_program()?,
                    config.max_workers,
                    config.poll_interval(),
                    config.collect_timeout(),
                ))
            }
            ParallelMode::Htcondor => {
                let area = WorkingArea::create(&config.working_area_root())?;
                Box::new(BatchQueueBackend::new(
                    area,
                    config.worker_program()?,
                    config.htcondor_job_desc_extra.clone(),
                    runner,
                    config.poll_interval(),
                    config.collect_timeout(),
                ))
            }
        };
        let mut execution = Self::new(backend, progress);
        execution.user_modules = config.user_modules.clone();
        Ok(execution)
    }

    /// Rebuild a running facade from a descriptor written by an earlier process
    pub fn attach(
        descriptor: &BackendDescriptor,
        pending: &[TaskHandle],
        runner: Arc<dyn ProcessRunner>,
        progress: ProgressMonitor,
    ) -> LoopResult<Self> {
        let backend: Box<dyn ExecutionBackend> = match descriptor {
            BackendDescriptor::Subprocess { .. } => {
                Box::new(SubprocessBackend::from_descriptor(descriptor)?)
            }
            BackendDescriptor::Htcondor { .. } => {
                Box::new(BatchQueueBackend::from_descriptor(descriptor, runner)?)
            }
        };
        info!(
            "Re-attached to {} backend in {} with {} pending task(s)",
            backend.name(),
            descriptor.working_area().display(),
            pending.len()
        );
        progress.tasks_inherited(pending.len());
        Ok(Self {
            backend,
            state: ExecutionState::Running,
            progress,
            user_modules: Vec::new(),
            outstanding: pending.iter().map(|h| h.task_id).collect(),
        })
    }

    pub fn into_shared(self) -> SharedExecution {
        Arc::new(Mutex::new(self))
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn working_area(&self) -> Option<&WorkingArea> {
        self.backend.working_area()
    }

    pub fn descriptor(&self) -> Option<BackendDescriptor> {
        self.backend.descriptor()
    }

    fn expect_state(&self, expected: ExecutionState, label: &'static str) -> LoopResult<()> {
        if self.state != expected {
            return Err(LoopError::InvalidState {
                component: "parallel execution",
                expected: label,
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Allocate the backend's resources; valid exactly once
    pub async fn begin(&mut self) -> LoopResult<()> {
        self.expect_state(ExecutionState::Created, "Created")?;
        if let Some(area) = self.backend.working_area() {
            area.pack_modules(&self.user_modules)?;
        }
        self.backend.begin().await?;
        self.state = ExecutionState::Running;
        info!("Started {} backend", self.backend.name());
        Ok(())
    }

    pub async fn dispatch(&mut self, package: TaskPackage) -> LoopResult<TaskHandle> {
        self.expect_state(ExecutionState::Running, "Running")?;
        let handle = self.backend.dispatch(package).await?;
        self.outstanding.insert(handle.task_id);
        self.progress.task_submitted();
        debug!("Dispatched task {} ({})", handle.task_id, handle.unit);
        Ok(handle)
    }

    /// Wait for every handle and return the results keyed by task id
    pub async fn collect(
        &mut self,
        handles: &[TaskHandle],
    ) -> LoopResult<HashMap<u64, TaskResult>> {
        self.expect_state(ExecutionState::Running, "Running")?;
        let mut results = HashMap::with_capacity(handles.len());
        loop {
            let pending: Vec<TaskHandle> = handles
                .iter()
                .filter(|h| !results.contains_key(&h.task_id))
                .cloned()
                .collect();
            if pending.is_empty() {
                break;
            }

            let result = self.backend.next_completed(&pending).await?;
            if !pending.iter().any(|h| h.task_id == result.task_id) {
                warn!("Ignoring result of task {} nobody waits for", result.task_id);
                continue;
            }
            debug!("Collected task {}", result.task_id);
            if self.outstanding.remove(&result.task_id) {
                self.progress.task_completed();
            }
            results.insert(result.task_id, result);
        }
        Ok(results)
    }

    pub fn progress(&self) -> ProgressReport {
        self.progress.report()
    }

    /// Kill all in-flight tasks; irreversible
    pub async fn terminate(&mut self) -> LoopResult<()> {
        match self.state {
            ExecutionState::Running => {
                warn!(
                    "Terminating {} outstanding task(s) on {} backend",
                    self.outstanding.len(),
                    self.backend.name()
                );
                self.backend.terminate().await?;
                self.state = ExecutionState::Terminated;
            }
            ExecutionState::Created => self.state = ExecutionState::Terminated,
            ExecutionState::Terminated | ExecutionState::Ended => {}
        }
        Ok(())
    }

    /// Release the backend; waits for outstanding tasks unless terminated
    pub async fn end(&mut self) -> LoopResult<()> {
        match self.state {
            ExecutionState::Ended => return Ok(()),
            ExecutionState::Created => {}
            ExecutionState::Running | ExecutionState::Terminated => {
                if self.state == ExecutionState::Running && !self.outstanding.is_empty() {
                    info!(
                        "Waiting for {} outstanding task(s) to finish",
                        self.outstanding.len()
                    );
                }
                self.backend.end().await?;
            }
        }
        self.state = ExecutionState::Ended;
        self.progress.finish();
        info!("Ended {} backend", self.backend.name());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Backend whose completion order is scripted by the test

    use super::*;
    use crate::parallel::task::execute;
    use std::collections::VecDeque;

    pub struct ScriptedBackend {
        registry: Registry,
        completed: HashMap<u64, TaskResult>,
        order: VecDeque<u64>,
        pub ended: Arc<std::sync::atomic::AtomicBool>,
        pub terminated: Arc<std::sync::atomic::AtomicBool>,
    }

    impl ScriptedBackend {
        /// Tasks complete in `order` (task ids); unlisted ids complete last
        pub fn new(order: Vec<u64>) -> Self {
            Self::with_registry(order, Registry::with_builtins())
        }

        pub fn with_registry(order: Vec<u64>, registry: Registry) -> Self {
            Self {
                registry,
                completed: HashMap::new(),
                order: order.into(),
                ended: Arc::default(),
                terminated: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl ExecutionBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn begin(&mut self) -> LoopResult<()> {
            Ok(())
        }

        async fn dispatch(&mut self, package: TaskPackage) -> LoopResult<TaskHandle> {
            let result = execute(&package, &self.registry)?;
            self.completed.insert(package.task_id, result);
            Ok(package.handle())
        }

        async fn next_completed(&mut self, pending: &[TaskHandle]) -> LoopResult<TaskResult> {
            while let Some(id) = self.order.pop_front() {
                if let Some(result) = self.completed.remove(&id) {
                    return Ok(result);
                }
            }
            let id = pending
                .iter()
                .map(|h| h.task_id)
                .find(|id| self.completed.contains_key(id))
                .ok_or_else(|| LoopError::backend("scripted", "nothing left to complete"))?;
            self.completed
                .remove(&id)
                .ok_or_else(|| LoopError::backend("scripted", "lost result"))
        }

        async fn terminate(&mut self) -> LoopResult<()> {
            self.terminated
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn end(&mut self) -> LoopResult<()> {
            self.ended.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn descriptor(&self) -> Option<BackendDescriptor> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedBackend;
    use super::*;
    use crate::composite::{ReaderCollectorComposite, SumCollector, UnitCounter};
    use crate::unit::WorkUnit;

    fn package(task_id: u64) -> TaskPackage {
        let mut composite = ReaderCollectorComposite::new();
        composite.add(UnitCounter, SumCollector::default());
        TaskPackage {
            task_id,
            unit: WorkUnit::new(format!("unit{task_id}")),
            readers: composite.reader_states().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_requires_begin() {
        let mut execution =
            ParallelExecution::new(Box::new(ScriptedBackend::new(vec![])), Default::default());
        let err = execution.dispatch(package(0)).await.unwrap_err();
        assert!(matches!(err, LoopError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_second_begin_is_rejected() {
        let mut execution =
            ParallelExecution::new(Box::new(ScriptedBackend::new(vec![])), Default::default());
        execution.begin().await.unwrap();
        assert!(execution.begin().await.is_err());
    }

    #[tokio::test]
    async fn test_collect_accepts_out_of_order_completion() {
        let mut execution = ParallelExecution::new(
            Box::new(ScriptedBackend::new(vec![2, 0, 1])),
            Default::default(),
        );
        execution.begin().await.unwrap();
        let mut handles = Vec::new();
        for id in 0..3 {
            handles.push(execution.dispatch(package(id)).await.unwrap());
        }
        assert_eq!(execution.progress().outstanding(), 3);

        let results = execution.collect(&handles).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(
            execution.progress(),
            ProgressReport {
                submitted: 3,
                completed: 3
            }
        );
        execution.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_is_safe_from_every_state() {
        let backend = ScriptedBackend::new(vec![]);
        let ended = backend.ended.clone();
        let mut execution = ParallelExecution::new(Box::new(backend), Default::default());
        execution.end().await.unwrap();
        execution.end().await.unwrap();
        assert_eq!(execution.state(), ExecutionState::Ended);
        assert!(!ended.load(std::sync::atomic::Ordering::SeqCst));

        let backend = ScriptedBackend::new(vec![]);
        let ended = backend.ended.clone();
        let terminated = backend.terminated.clone();
        let mut execution = ParallelExecution::new(Box::new(backend), Default::default());
        execution.begin().await.unwrap();
        execution.terminate().await.unwrap();
        execution.terminate().await.unwrap();
        execution.end().await.unwrap();
        assert!(terminated.load(std::sync::atomic::Ordering::SeqCst));
        assert!(ended.load(std::sync::atomic::Ordering::SeqCst));
        assert!(execution.dispatch(package(9)).await.is_err());
    }

    #[test]
    fn test_parallel_mode_parsing() {
        assert_eq!(
            "htcondor".parse::<ParallelMode>().unwrap(),
            ParallelMode::Htcondor
        );
        assert_eq!(
            "multiprocessing".parse::<ParallelMode>().unwrap(),
            ParallelMode::InProcess
        );
        assert!("grid".parse::<ParallelMode>().is_err());
        assert!(ParallelMode::Subprocess.is_detached());
        assert!(!ParallelMode::InProcess.is_detached());
    }
}
