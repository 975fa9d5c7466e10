//! Loop controllers
//!
//! [`UnitLoop`] drives a [`UnitReader`] over the work units in source order.
//! [`ResumableLoop`] adds a checkpoint between the last read and `end`, so a
//! run whose tasks outlive the process can be finished later by the resume
//! binary.

pub mod dispatch;

pub use dispatch::{DispatchState, DispatchedTask, DispatchingReader};

use crate::checkpoint::write_checkpoint;
use crate::composite::{CompositeOutput, CompositeState, ReaderCollectorComposite, Registry};
use crate::error::{LoopError, LoopResult};
use crate::parallel::ProgressMonitor;
use crate::subprocess::ProcessRunner;
use crate::unit::WorkUnit;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// The reader side a loop controller drives
#[async_trait]
pub trait UnitReader: Send {
    async fn begin(&mut self) -> LoopResult<()>;

    async fn read(&mut self, unit: &WorkUnit) -> LoopResult<()>;

    async fn end(&mut self) -> LoopResult<CompositeOutput>;
}

/// A reader whose complete state can be written to a checkpoint
#[async_trait]
pub trait Checkpointable: Send {
    async fn checkpoint_state(&mut self) -> LoopResult<PipelineState>;
}

/// Serialized pipeline, as stored in a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pipeline", rename_all = "snake_case")]
pub enum PipelineState {
    Composite(CompositeState),
    Dispatch(DispatchState),
}

impl PipelineState {
    /// Rebuild the pipeline in this process and end it
    ///
    /// Task results are only read, never consumed, so finalizing the same
    /// state twice yields the same output.
    pub async fn finalize(
        &self,
        registry: &Registry,
        runner: Arc<dyn ProcessRunner>,
        progress: ProgressMonitor,
    ) -> LoopResult<CompositeOutput> {
        match self {
            PipelineState::Composite(state) => {
                ReaderCollectorComposite::restore(state, registry)?.end()
            }
            PipelineState::Dispatch(state) => {
                let mut reader = DispatchingReader::restore(state, registry, runner, progress)?;
                let output = UnitReader::end(&mut reader).await;
                let ended = reader.execution().lock().await.end().await;
                let output = output?;
                ended?;
                Ok(output)
            }
        }
    }
}

#[async_trait]
impl UnitReader for ReaderCollectorComposite {
    async fn begin(&mut self) -> LoopResult<()> {
        ReaderCollectorComposite::begin(self)
    }

    async fn read(&mut self, unit: &WorkUnit) -> LoopResult<()> {
        ReaderCollectorComposite::read(self, unit)
    }

    async fn end(&mut self) -> LoopResult<CompositeOutput> {
        ReaderCollectorComposite::end(self)
    }
}

#[async_trait]
impl Checkpointable for ReaderCollectorComposite {
    async fn checkpoint_state(&mut self) -> LoopResult<PipelineState> {
        Ok(PipelineState::Composite(self.snapshot()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Created,
    Running,
    Checkpointed,
    Done,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn invalid_state(expected: &'static str, actual: LoopState) -> LoopError {
    LoopError::InvalidState {
        component: "loop controller",
        expected,
        actual: actual.to_string(),
    }
}

/// Plain loop controller: `Created -> Running -> Done`, no persistence
pub struct UnitLoop<R> {
    reader: R,
    state: LoopState,
    units_read: usize,
}

impl<R: UnitReader> UnitLoop<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            state: LoopState::Created,
            units_read: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn units_read(&self) -> usize {
        self.units_read
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub async fn begin(&mut self) -> LoopResult<()> {
        if self.state != LoopState::Created {
            return Err(invalid_state("Created", self.state));
        }
        self.reader.begin().await?;
        self.state = LoopState::Running;
        Ok(())
    }

    pub async fn read(&mut self, unit: &WorkUnit) -> LoopResult<()> {
        if self.state != LoopState::Running {
            return Err(invalid_state("Running", self.state));
        }
        debug!("Reading work unit {}", unit.label());
        self.reader.read(unit).await?;
        self.units_read += 1;
        Ok(())
    }

    /// Begin if needed, then read every unit in source order
    pub async fn run<'a, I>(&mut self, units: I) -> LoopResult<()>
    where
        I: IntoIterator<Item = &'a WorkUnit> + Send,
        I::IntoIter: Send,
    {
        if self.state == LoopState::Created {
            self.begin().await?;
        }
        for unit in units {
            self.read(unit).await?;
        }
        Ok(())
    }

    pub async fn end(&mut self) -> LoopResult<CompositeOutput> {
        if !matches!(self.state, LoopState::Running | LoopState::Checkpointed) {
            return Err(invalid_state("Running", self.state));
        }
        let output = self.reader.end().await?;
        self.state = LoopState::Done;
        info!("Loop finished after {} work unit(s)", self.units_read);
        Ok(output)
    }
}

/// Loop controller that checkpoints its reader before `end`
///
/// `Created -> Running -> Checkpointed -> Done`. The checkpoint is written at
/// most once, after the last unit has been read.
pub struct ResumableLoop<R> {
    inner: UnitLoop<R>,
    checkpoint_path: PathBuf,
}

impl<R: UnitReader + Checkpointable> ResumableLoop<R> {
    pub fn new(reader: R, checkpoint_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: UnitLoop::new(reader),
            checkpoint_path: checkpoint_path.into(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.inner.state
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    pub fn reader(&self) -> &R {
        &self.inner.reader
    }

    pub async fn begin(&mut self) -> LoopResult<()> {
        self.inner.begin().await
    }

    pub async fn read(&mut self, unit: &WorkUnit) -> LoopResult<()> {
        self.inner.read(unit).await
    }

    /// Read every unit, then write the checkpoint
    pub async fn run<'a, I>(&mut self, units: I) -> LoopResult<()>
    where
        I: IntoIterator<Item = &'a WorkUnit> + Send,
        I::IntoIter: Send,
    {
        self.inner.run(units).await?;
        self.checkpoint().await
    }

    pub async fn checkpoint(&mut self) -> LoopResult<()> {
        if self.inner.state != LoopState::Running {
            return Err(invalid_state("Running", self.inner.state));
        }
        let state = self.inner.reader.checkpoint_state().await?;
        write_checkpoint(&self.checkpoint_path, &state).await?;
        self.inner.state = LoopState::Checkpointed;
        info!(
            "Checkpointed {} work unit(s) to {}",
            self.inner.units_read,
            self.checkpoint_path.display()
        );
        Ok(())
    }

    /// Finish in this process; checkpoints first if that has not happened yet
    pub async fn end(&mut self) -> LoopResult<CompositeOutput> {
        if self.inner.state == LoopState::Running {
            self.checkpoint().await?;
        }
        if self.inner.state != LoopState::Checkpointed {
            return Err(invalid_state("Checkpointed", self.inner.state));
        }
        self.inner.end().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{read_checkpoint, CHECKPOINT_FILE_NAME};
    use crate::composite::{FieldReader, SumCollector, UnitCounter};
    use serde_json::json;
    use tempfile::TempDir;

    fn composite() -> ReaderCollectorComposite {
        let mut composite = ReaderCollectorComposite::new();
        composite.add(UnitCounter, SumCollector::default());
        composite.add(FieldReader::new("events"), SumCollector::default());
        composite
    }

    fn units() -> Vec<WorkUnit> {
        [("TTJets", 120), ("WJets", 75), ("QCD", 305)]
            .into_iter()
            .map(|(name, events)| WorkUnit::new(name).with_metadata("events", events))
            .collect()
    }

    #[tokio::test]
    async fn test_plain_loop_counts_and_sums() {
        let mut unit_loop = UnitLoop::new(composite());
        unit_loop.run(&units()).await.unwrap();
        let output = unit_loop.end().await.unwrap();
        assert_eq!(output.results, vec![json!(3), json!(500)]);
        assert_eq!(unit_loop.state(), LoopState::Done);
    }

    #[tokio::test]
    async fn test_read_before_begin_is_rejected() {
        let mut unit_loop = UnitLoop::new(composite());
        let err = unit_loop.read(&units()[0]).await.unwrap_err();
        assert!(matches!(err, LoopError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_resumable_loop_matches_plain_loop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);

        let mut plain = UnitLoop::new(composite());
        plain.run(&units()).await.unwrap();
        let expected = plain.end().await.unwrap();

        let mut resumable = ResumableLoop::new(composite(), &path);
        resumable.run(&units()).await.unwrap();
        assert_eq!(resumable.state(), LoopState::Checkpointed);
        assert!(path.exists());
        let output = resumable.end().await.unwrap();
        assert_eq!(output, expected);
    }

    #[tokio::test]
    async fn test_checkpoint_is_written_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        let mut resumable = ResumableLoop::new(composite(), &path);
        resumable.run(&units()).await.unwrap();
        assert!(resumable.checkpoint().await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_restores_to_same_result() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        let mut resumable = ResumableLoop::new(composite(), &path);
        resumable.run(&units()).await.unwrap();

        let state: PipelineState = read_checkpoint(&path).await.unwrap();
        let registry = Registry::with_builtins();
        let runner = Arc::new(crate::subprocess::MockProcessRunner::new());
        let first = state
            .finalize(&registry, runner.clone(), ProgressMonitor::default())
            .await
            .unwrap();
        let second = state
            .finalize(&registry, runner, ProgressMonitor::default())
            .await
            .unwrap();

        let expected = resumable.end().await.unwrap();
        assert_eq!(first, expected);
        assert_eq!(second, expected);
    }
}
