//! Detached worker processes that exchange files through the working area

use super::task::{check_result_files, write_task_file};
use super::{BackendDescriptor, ExecutionBackend, TaskHandle, TaskPackage, TaskResult};
use crate::error::{LoopError, LoopResult};
use crate::subprocess::{ExitStatus, ProcessCommandBuilder, TokioProcessRunner};
use crate::working_area::{module_path_with, WorkingArea, MODULE_PATH_ENV};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tracing::{debug, info, warn};

const BACKEND: &str = "subprocess";

/// One `batchloop-worker` process per task
///
/// Completion is observed by polling for the task's result or failure file,
/// so a later process can pick up results of workers it never spawned. Worker
/// pids travel in the descriptor; a re-attached backend treats a task whose
/// worker pid no longer exists, and which left no result, as failed.
pub struct SubprocessBackend {
    area: WorkingArea,
    worker_program: PathBuf,
    max_workers: Option<usize>,
    poll_interval: Duration,
    collect_timeout: Option<Duration>,
    children: HashMap<u64, Child>,
    /// Our workers that have exited, waiting to be matched with their task
    exited: HashMap<u64, ExitStatus>,
    /// Workers started by an earlier process
    adopted: BTreeMap<u64, u32>,
}

impl SubprocessBackend {
    pub fn new(
        area: WorkingArea,
        worker_program: PathBuf,
        max_workers: Option<usize>,
        poll_interval: Duration,
        collect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            area,
            worker_program,
            max_workers,
            poll_interval,
            collect_timeout,
            children: HashMap::new(),
            exited: HashMap::new(),
            adopted: BTreeMap::new(),
        }
    }

    pub fn from_descriptor(descriptor: &BackendDescriptor) -> LoopResult<Self> {
        let BackendDescriptor::Subprocess {
            working_area,
            worker_program,
            max_workers,
            poll_interval_ms,
            collect_timeout_secs,
            workers,
        } = descriptor
        else {
            return Err(LoopError::backend(
                BACKEND,
                format!(
                    "cannot attach to tasks of a {} backend",
                    descriptor.mode()
                ),
            ));
        };

        let mut backend = Self::new(
            WorkingArea::open(working_area),
            worker_program.clone(),
            *max_workers,
            Duration::from_millis(*poll_interval_ms),
            collect_timeout_secs.map(Duration::from_secs),
        );
        backend.adopted = workers.clone();
        Ok(backend)
    }

    /// Move children that have exited into `exited`; returns how many still run
    fn reap(&mut self) -> usize {
        let exited = &mut self.exited;
        self.children.retain(|task_id, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Worker for task {} exited: {}", task_id, status);
                exited.insert(*task_id, ExitStatus::from(status));
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Cannot query worker for task {}: {}", task_id, e);
                exited.insert(*task_id, ExitStatus::Error(-1));
                false
            }
        });
        self.children.len()
    }

    async fn wait_for_slot(&mut self) {
        let Some(limit) = self.max_workers else {
            return;
        };
        while self.reap() >= limit {
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Why the worker for `task_id` can no longer produce a result, if so
    fn worker_gone(&mut self, task_id: u64) -> Option<String> {
        self.reap();
        if let Some(status) = self.exited.remove(&task_id) {
            return Some(format!("worker exited with {status:?}"));
        }
        if self.children.contains_key(&task_id) {
            return None;
        }
        match self.adopted.get(&task_id) {
            Some(&pid) if pid_alive(pid) => None,
            Some(&pid) => {
                self.adopted.remove(&task_id);
                Some(format!("worker pid {pid} is gone"))
            }
            None => Some("no worker is running for it".to_string()),
        }
    }

    fn open_logs(&self, task_id: u64) -> LoopResult<(std::fs::File, std::fs::File)> {
        let log_dir = self.area.log_dir();
        std::fs::create_dir_all(&log_dir)?;
        let stdout = std::fs::File::create(log_dir.join(format!("task_{task_id:05}.out")))?;
        let stderr = std::fs::File::create(log_dir.join(format!("task_{task_id:05}.err")))?;
        Ok((stdout, stderr))
    }
}

#[async_trait]
impl ExecutionBackend for SubprocessBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn begin(&mut self) -> LoopResult<()> {
        tokio::fs::create_dir_all(self.area.log_dir()).await?;
        info!(
            "Detached workers run {} in {}",
            self.worker_program.display(),
            self.area.path().display()
        );
        Ok(())
    }

    async fn dispatch(&mut self, package: TaskPackage) -> LoopResult<TaskHandle> {
        self.wait_for_slot().await;
        write_task_file(&self.area, &package).await?;

        let task_path = self.area.task_path(package.task_id);
        let module_path =
            module_path_with(&self.area.modules_dir(), std::env::var_os(MODULE_PATH_ENV))?;
        let command = ProcessCommandBuilder::new(self.worker_program.to_string_lossy())
            .arg(task_path.to_string_lossy())
            .current_dir(self.area.path())
            .env(MODULE_PATH_ENV, module_path)
            .build();
        let (stdout, stderr) = self.open_logs(package.task_id)?;
        let child = TokioProcessRunner::spawn_detached(&command, stdout, stderr)
            .map_err(|e| e.into_backend_error(BACKEND, "failed to start worker"))?;

        debug!(
            "Started worker pid {:?} for task {}",
            child.id(),
            package.task_id
        );
        self.children.insert(package.task_id, child);
        Ok(package.handle())
    }

    async fn next_completed(&mut self, pending: &[TaskHandle]) -> LoopResult<TaskResult> {
        let started = Instant::now();
        loop {
            for handle in pending {
                if let Some(result) = check_result_files(&self.area, handle).await? {
                    self.children.remove(&handle.task_id);
                    self.exited.remove(&handle.task_id);
                    self.adopted.remove(&handle.task_id);
                    return Ok(result);
                }
                if let Some(reason) = self.worker_gone(handle.task_id) {
                    // The worker may have finished between the two checks
                    if let Some(result) = check_result_files(&self.area, handle).await? {
                        return Ok(result);
                    }
                    return Err(LoopError::TaskFailed {
                        task_id: handle.task_id,
                        unit: handle.unit.clone(),
                        message: format!("{reason} without writing a result"),
                    });
                }
            }

            if let Some(timeout) = self.collect_timeout {
                if started.elapsed() >= timeout {
                    return Err(LoopError::backend(
                        BACKEND,
                        format!(
                            "none of {} task(s) finished within {:?}",
                            pending.len(),
                            timeout
                        ),
                    ));
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn terminate(&mut self) -> LoopResult<()> {
        for (task_id, child) in self.children.iter_mut() {
            if let Some(pid) = child.id() {
                signal_group(*task_id, pid);
            }
            if let Err(e) = child.start_kill() {
                debug!("Worker for task {} already gone: {}", task_id, e);
            }
        }
        for (task_id, pid) in &self.adopted {
            if pid_alive(*pid) {
                signal_group(*task_id, *pid);
            }
        }
        Ok(())
    }

    async fn end(&mut self) -> LoopResult<()> {
        for (task_id, mut child) in self.children.drain() {
            match child.wait().await {
                Ok(status) => debug!("Worker for task {} finished: {}", task_id, status),
                Err(e) => warn!("Lost worker for task {}: {}", task_id, e),
            }
        }
        Ok(())
    }

    fn descriptor(&self) -> Option<BackendDescriptor> {
        Some(BackendDescriptor::Subprocess {
            working_area: self.area.path().to_path_buf(),
            worker_program: self.worker_program.clone(),
            max_workers: self.max_workers,
            poll_interval_ms: self.poll_interval.as_millis() as u64,
            collect_timeout_secs: self.collect_timeout.map(|t| t.as_secs()),
            workers: self
                .children
                .iter()
                .filter_map(|(task_id, child)| child.id().map(|pid| (*task_id, pid)))
                .chain(self.adopted.iter().map(|(task_id, pid)| (*task_id, *pid)))
                .collect(),
        })
    }

    fn working_area(&self) -> Option<&WorkingArea> {
        Some(&self.area)
    }
}

/// Whether a process with this pid still exists
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// SIGTERM the process group a worker leads
#[cfg(unix)]
fn signal_group(task_id: u64, pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(-(pid as i32)), Signal::SIGTERM) {
        debug!("Cannot signal worker group {} of task {}: {}", pid, task_id, e);
    }
}

#[cfg(not(unix))]
fn signal_group(_task_id: u64, _pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::composite::{ReaderCollectorComposite, SumCollector, UnitCounter};
    use crate::parallel::task::{write_gz_json, TaskResult};
    use crate::unit::WorkUnit;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn package(task_id: u64) -> TaskPackage {
        let mut composite = ReaderCollectorComposite::new();
        composite.add(UnitCounter, SumCollector::default());
        TaskPackage {
            task_id,
            unit: WorkUnit::new("QCD"),
            readers: composite.reader_states().unwrap(),
        }
    }

    fn backend(area: WorkingArea, worker: &str) -> SubprocessBackend {
        SubprocessBackend::new(
            area,
            PathBuf::from(worker),
            Some(2),
            Duration::from_millis(10),
            Some(Duration::from_secs(10)),
        )
    }

    #[tokio::test]
    async fn test_worker_exit_without_result_is_task_failure() {
        let dir = TempDir::new().unwrap();
        let area = WorkingArea::create(dir.path()).unwrap();
        let mut backend = backend(area, "true");
        backend.begin().await.unwrap();

        let handle = backend.dispatch(package(1)).await.unwrap();
        assert!(backend.area.task_path(1).exists());
        let err = backend.next_completed(&[handle]).await.unwrap_err();
        assert!(matches!(err, LoopError::TaskFailed { task_id: 1, .. }), "{err}");
        backend.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_result_file_written_by_another_process_is_collected() {
        let dir = TempDir::new().unwrap();
        let area = WorkingArea::create(dir.path()).unwrap();
        let descriptor = backend(area.clone(), "true").descriptor().unwrap();

        let result = TaskResult {
            task_id: 4,
            outputs: vec![json!(1)],
            readers: vec![Value::Null],
        };
        write_gz_json(&area.result_path(4), &result).await.unwrap();

        let mut attached = SubprocessBackend::from_descriptor(&descriptor).unwrap();
        let handle = TaskHandle {
            task_id: 4,
            unit: "QCD".to_string(),
        };
        assert_eq!(attached.next_completed(&[handle]).await.unwrap(), result);
    }

    #[tokio::test]
    async fn test_terminate_kills_running_workers() {
        let dir = TempDir::new().unwrap();
        let area = WorkingArea::create(dir.path()).unwrap();
        let mut backend = backend(area, "true");
        backend.begin().await.unwrap();

        let command = ProcessCommandBuilder::new("sleep").arg("30").build();
        let (stdout, stderr) = backend.open_logs(9).unwrap();
        let child = TokioProcessRunner::spawn_detached(&command, stdout, stderr).unwrap();
        backend.children.insert(9, child);

        let started = Instant::now();
        backend.terminate().await.unwrap();
        backend.end().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(backend.children.is_empty());
    }

    #[tokio::test]
    async fn test_collect_timeout_is_fatal() {
        let dir = TempDir::new().unwrap();
        let area = WorkingArea::create(dir.path()).unwrap();
        let mut attached = SubprocessBackend::new(
            area,
            PathBuf::from("true"),
            None,
            Duration::from_millis(5),
            Some(Duration::from_millis(50)),
        );
        let handle = TaskHandle {
            task_id: 2,
            unit: "QCD".to_string(),
        };
        let err = attached.next_completed(&[handle]).await.unwrap_err();
        assert!(matches!(err, LoopError::Backend { .. }));
    }

    fn attached(
        area: &WorkingArea,
        workers: BTreeMap<u64, u32>,
        timeout_ms: Option<u64>,
    ) -> SubprocessBackend {
        let descriptor = BackendDescriptor::Subprocess {
            working_area: area.path().to_path_buf(),
            worker_program: PathBuf::from("true"),
            max_workers: None,
            poll_interval_ms: 5,
            collect_timeout_secs: None,
            workers,
        };
        let mut backend = SubprocessBackend::from_descriptor(&descriptor).unwrap();
        backend.collect_timeout = timeout_ms.map(Duration::from_millis);
        backend
    }

    fn qcd(task_id: u64) -> TaskHandle {
        TaskHandle {
            task_id,
            unit: "QCD".to_string(),
        }
    }

    #[tokio::test]
    async fn test_attached_task_without_worker_fails_without_timeout() {
        let dir = TempDir::new().unwrap();
        let area = WorkingArea::create(dir.path()).unwrap();
        let mut backend = attached(&area, BTreeMap::new(), None);

        let outcome =
            tokio::time::timeout(Duration::from_secs(3), backend.next_completed(&[qcd(2)])).await;
        let err = outcome.expect("must not poll forever").unwrap_err();
        assert!(matches!(err, LoopError::TaskFailed { task_id: 2, .. }), "{err}");
    }

    #[tokio::test]
    async fn test_attached_task_whose_worker_died_fails() {
        let dir = TempDir::new().unwrap();
        let area = WorkingArea::create(dir.path()).unwrap();
        let mut dead = std::process::Command::new("true").spawn().unwrap();
        let pid = dead.id();
        dead.wait().unwrap();

        let mut backend = attached(&area, BTreeMap::from([(3, pid)]), None);
        let outcome =
            tokio::time::timeout(Duration::from_secs(3), backend.next_completed(&[qcd(3)])).await;
        match outcome.expect("must not poll forever").unwrap_err() {
            LoopError::TaskFailed { task_id, message, .. } => {
                assert_eq!(task_id, 3);
                assert!(message.contains("is gone"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_attached_task_with_live_worker_keeps_waiting() {
        let dir = TempDir::new().unwrap();
        let area = WorkingArea::create(dir.path()).unwrap();
        let mut alive = std::process::Command::new("sleep").arg("30").spawn().unwrap();

        let mut backend = attached(&area, BTreeMap::from([(5, alive.id())]), Some(50));
        let err = backend.next_completed(&[qcd(5)]).await.unwrap_err();
        alive.kill().unwrap();
        alive.wait().unwrap();
        assert!(matches!(err, LoopError::Backend { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_descriptor_records_running_worker_pids() {
        let dir = TempDir::new().unwrap();
        let area = WorkingArea::create(dir.path()).unwrap();
        let mut backend = backend(area, "true");

        let command = ProcessCommandBuilder::new("sleep").arg("30").build();
        let (stdout, stderr) = backend.open_logs(6).unwrap();
        let child = TokioProcessRunner::spawn_detached(&command, stdout, stderr).unwrap();
        let pid = child.id().unwrap();
        backend.children.insert(6, child);

        match backend.descriptor().unwrap() {
            BackendDescriptor::Subprocess { workers, .. } => {
                assert_eq!(workers, BTreeMap::from([(6, pid)]))
            }
            other => panic!("unexpected descriptor: {other:?}"),
        }
        backend.terminate().await.unwrap();
        backend.end().await.unwrap();
    }

    #[test]
    fn test_htcondor_descriptor_is_rejected() {
        let descriptor = BackendDescriptor::Htcondor {
            working_area: PathBuf::from("/tmp/wa"),
            worker_program: PathBuf::from("batchloop-worker"),
            job_desc_extra: Vec::new(),
            poll_interval_ms: 10,
            collect_timeout_secs: None,
            clusters: BTreeMap::from([(0, 12)]),
        };
        let err = SubprocessBackend::from_descriptor(&descriptor).err().unwrap();
        assert!(err.to_string().contains("htcondor"), "{err}");
    }
}
