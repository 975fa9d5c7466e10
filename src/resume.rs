//! Resume Utility
//!
//! Finishes a checkpointed run in a fresh process:
//! 1. the working area is the checkpoint's parent directory;
//! 2. the runtime-module archive is extracted once, under the lock marker;
//! 3. the extracted directory goes in front of the module search path held
//!    by the registry, ahead of any inherited `BATCHLOOP_MODULE_PATH`;
//! 4. the checkpoint is deserialized;
//! 5. the pipeline is ended and its output returned.

use crate::checkpoint::read_checkpoint;
use crate::composite::{CompositeOutput, Registry};
use crate::error::{LoopError, LoopResult};
use crate::loops::PipelineState;
use crate::parallel::ProgressMonitor;
use crate::subprocess::{ProcessRunner, TokioProcessRunner};
use crate::working_area::{Extraction, WorkingArea, MODULE_PATH_ENV};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default bound on waiting for another process's extraction
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

pub struct Resume {
    registry: Registry,
    runner: Arc<dyn ProcessRunner>,
    progress: ProgressMonitor,
    lock_timeout: Duration,
}

impl std::fmt::Debug for Resume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resume")
            .field("registry", &self.registry)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl Resume {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            runner: Arc::new(TokioProcessRunner),
            progress: ProgressMonitor::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_progress(mut self, progress: ProgressMonitor) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub async fn run(mut self, checkpoint: &Path) -> LoopResult<CompositeOutput> {
        if !checkpoint.is_file() {
            return Err(LoopError::CheckpointRead {
                path: checkpoint.to_path_buf(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "checkpoint file does not exist",
                )),
            });
        }

        let area = WorkingArea::open(working_area_of(checkpoint));
        info!("Resuming from {}", checkpoint.display());

        match area.ensure_extracted(self.lock_timeout).await? {
            Extraction::NoArchive => debug!("No runtime-module archive to extract"),
            Extraction::Extracted => info!("Extracted runtime modules"),
            Extraction::AlreadyExtracted | Extraction::WaitedForPeer => {
                debug!("Runtime modules already extracted")
            }
        }

        self.registry
            .inherit_search_path(std::env::var_os(MODULE_PATH_ENV));
        let modules_dir = area.modules_dir();
        if modules_dir.is_dir() {
            self.registry.prepend_search_path(&modules_dir);
        }

        let state: PipelineState = read_checkpoint(checkpoint).await?;
        let output = state
            .finalize(&self.registry, self.runner, self.progress)
            .await?;
        info!(
            "Finalized {} result(s) from {}",
            output.results.len(),
            checkpoint.display()
        );
        Ok(output)
    }
}

/// Directory holding `checkpoint`; a bare file name means the current directory
pub fn working_area_of(checkpoint: &Path) -> PathBuf {
    match checkpoint.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
