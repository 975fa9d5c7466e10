//! HTCondor batch-queue backend
//!
//! Each task becomes one single-job cluster submitted with `condor_submit`.
//! Jobs run `batchloop-worker` on the task file, so completion is observed
//! the same way as for detached subprocesses: through the result and failure
//! files in the shared working area. `condor_q` tells jobs that are still
//! queued apart from jobs that vanished without a result.

use super::task::{check_result_files, write_task_file};
use super::{BackendDescriptor, ExecutionBackend, TaskHandle, TaskPackage, TaskResult};
use crate::error::{LoopError, LoopResult};
use crate::subprocess::{ProcessCommandBuilder, ProcessRunner};
use crate::working_area::WorkingArea;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BACKEND: &str = "htcondor";

/// Bound on a single condor_submit / condor_q / condor_rm call
const SCHEDULER_TIMEOUT: Duration = Duration::from_secs(120);

pub struct BatchQueueBackend {
    area: WorkingArea,
    worker_program: PathBuf,
    job_desc_extra: Vec<String>,
    runner: Arc<dyn ProcessRunner>,
    poll_interval: Duration,
    collect_timeout: Option<Duration>,
    clusters: BTreeMap<u64, u64>,
}

impl BatchQueueBackend {
    pub fn new(
        area: WorkingArea,
        worker_program: PathBuf,
        job_desc_extra: Vec<String>,
        runner: Arc<dyn ProcessRunner>,
        poll_interval: Duration,
        collect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            area,
            worker_program,
            job_desc_extra,
            runner,
            poll_interval,
            collect_timeout,
            clusters: BTreeMap::new(),
        }
    }

    pub fn from_descriptor(
        descriptor: &BackendDescriptor,
        runner: Arc<dyn ProcessRunner>,
    ) -> LoopResult<Self> {
        let BackendDescriptor::Htcondor {
            working_area,
            worker_program,
            job_desc_extra,
            poll_interval_ms,
            collect_timeout_secs,
            clusters,
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
            job_desc_extra.clone(),
            runner,
            Duration::from_millis(*poll_interval_ms),
            collect_timeout_secs.map(Duration::from_secs),
        );
        backend.clusters = clusters.clone();
        Ok(backend)
    }

    /// Submit description for one task
    pub fn job_description(&self, task_id: u64) -> String {
        let task_path = self.area.task_path(task_id);
        let mut lines = vec![
            "universe = vanilla".to_string(),
            format!("executable = {}", self.worker_program.display()),
            format!("arguments = \"{}\"", task_path.display()),
            format!("initialdir = {}", self.area.path().display()),
            format!("output = logs/task_{task_id:05}.out"),
            format!("error = logs/task_{task_id:05}.err"),
            format!("log = logs/task_{task_id:05}.log"),
            "getenv = True".to_string(),
        ];
        lines.extend(self.job_desc_extra.iter().cloned());
        lines.push("queue 1".to_string());
        let mut description = lines.join("\n");
        description.push('\n');
        description
    }

    /// Cluster id from `condor_submit` output ("1 job(s) submitted to cluster 42.")
    pub fn parse_cluster_id(stdout: &str) -> Option<u64> {
        stdout.lines().find_map(|line| {
            let (_, rest) = line.split_once("submitted to cluster")?;
            rest.trim().trim_end_matches('.').parse().ok()
        })
    }

    /// Clusters of ours that the scheduler still knows about
    async fn queued_clusters(&self) -> LoopResult<HashSet<u64>> {
        if self.clusters.is_empty() {
            return Ok(HashSet::new());
        }
        let ids: Vec<String> = self.clusters.values().map(|id| id.to_string()).collect();
        let command = ProcessCommandBuilder::new("condor_q")
            .args(&ids)
            .args(["-af", "ClusterId"])
            .timeout(SCHEDULER_TIMEOUT)
            .build();
        let output = self
            .runner
            .run(command)
            .await
            .map_err(|e| e.into_backend_error(BACKEND, "condor_q failed"))?;
        if !output.status.success() {
            return Err(LoopError::backend(
                BACKEND,
                format!("condor_q failed: {}", output.stderr.trim()),
            ));
        }
        Ok(output
            .stdout
            .split_whitespace()
            .filter_map(|id| id.parse().ok())
            .collect())
    }
}

#[async_trait]
impl ExecutionBackend for BatchQueueBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn begin(&mut self) -> LoopResult<()> {
        tokio::fs::create_dir_all(self.area.log_dir()).await?;
        info!(
            "Submitting jobs to HTCondor from {}",
            self.area.path().display()
        );
        Ok(())
    }

    async fn dispatch(&mut self, package: TaskPackage) -> LoopResult<TaskHandle> {
        write_task_file(&self.area, &package).await?;

        let submit_path = self
            .area
            .task_path(package.task_id)
            .with_extension("")
            .with_extension("sub");
        tokio::fs::write(&submit_path, self.job_description(package.task_id)).await?;

        let command = ProcessCommandBuilder::new("condor_submit")
            .arg(&submit_path.to_string_lossy())
            .current_dir(self.area.path())
            .timeout(SCHEDULER_TIMEOUT)
            .build();
        let output = self
            .runner
            .run(command)
            .await
            .map_err(|e| e.into_backend_error(BACKEND, "condor_submit failed"))?;
        if !output.status.success() {
            return Err(LoopError::backend(
                BACKEND,
                format!(
                    "condor_submit rejected task {}: {}",
                    package.task_id,
                    output.stderr.trim()
                ),
            ));
        }
        let cluster = Self::parse_cluster_id(&output.stdout).ok_or_else(|| {
            LoopError::backend(
                BACKEND,
                format!("no cluster id in condor_submit output: {}", output.stdout.trim()),
            )
        })?;

        debug!("Task {} submitted as cluster {}", package.task_id, cluster);
        self.clusters.insert(package.task_id, cluster);
        Ok(package.handle())
    }

    async fn next_completed(&mut self, pending: &[TaskHandle]) -> LoopResult<TaskResult> {
        let started = Instant::now();
        loop {
            for handle in pending {
                if let Some(result) = check_result_files(&self.area, handle).await? {
                    return Ok(result);
                }
            }

            let queued = self.queued_clusters().await?;
            for handle in pending {
                let Some(cluster) = self.clusters.get(&handle.task_id) else {
                    continue;
                };
                if queued.contains(cluster) {
                    continue;
                }
                // Left the queue; the result may have landed meanwhile
                if let Some(result) = check_result_files(&self.area, handle).await? {
                    return Ok(result);
                }
                return Err(LoopError::TaskFailed {
                    task_id: handle.task_id,
                    unit: handle.unit.clone(),
                    message: format!("cluster {cluster} left the queue without a result"),
                });
            }

            if let Some(timeout) = self.collect_timeout {
                if started.elapsed() >= timeout {
                    return Err(LoopError::backend(
                        BACKEND,
                        format!(
                            "none of {} job(s) finished within {:?}",
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
        if self.clusters.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = self.clusters.values().map(|id| id.to_string()).collect();
        let command = ProcessCommandBuilder::new("condor_rm")
            .args(&ids)
            .timeout(SCHEDULER_TIMEOUT)
            .build();
        let output = self
            .runner
            .run(command)
            .await
            .map_err(|e| e.into_backend_error(BACKEND, "condor_rm failed"))?;
        if !output.status.success() {
            // Clusters that already finished make condor_rm complain
            warn!("condor_rm: {}", output.stderr.trim());
        }
        info!("Removed {} cluster(s)", ids.len());
        Ok(())
    }

    async fn end(&mut self) -> LoopResult<()> {
        let started = Instant::now();
        loop {
            let queued = self.queued_clusters().await?;
            if queued.is_empty() {
                return Ok(());
            }
            if let Some(timeout) = self.collect_timeout {
                if started.elapsed() >= timeout {
                    return Err(LoopError::backend(
                        BACKEND,
                        format!(
                            "{} cluster(s) still queued after {:?}",
                            queued.len(),
                            timeout
                        ),
                    ));
                }
            }
            debug!("{} cluster(s) still queued", queued.len());
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn descriptor(&self) -> Option<BackendDescriptor> {
        Some(BackendDescriptor::Htcondor {
            working_area: self.area.path().to_path_buf(),
            worker_program: self.worker_program.clone(),
            job_desc_extra: self.job_desc_extra.clone(),
            poll_interval_ms: self.poll_interval.as_millis() as u64,
            collect_timeout_secs: self.collect_timeout.map(|t| t.as_secs()),
            clusters: self.clusters.clone(),
        })
    }

    fn working_area(&self) -> Option<&WorkingArea> {
        Some(&self.area)
    }
}
