//! Units of work exchanged with workers
//!
//! A task package carries one (possibly split) work unit and the reader-side
//! state of the composite. Workers rebuild the readers from a [`Registry`],
//! read the unit, end the readers, and hand back one output and one finished
//! reader value per member. Detached workers
//! exchange packages and results as gzip JSON files in the working area.

use crate::checkpoint::{compress, decompress};
use crate::composite::{KindState, ReaderCollectorComposite, Registry};
use crate::error::{LoopError, LoopResult};
use crate::unit::WorkUnit;
use crate::working_area::WorkingArea;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPackage {
    pub task_id: u64,
    pub unit: WorkUnit,
    pub readers: Vec<KindState>,
}

impl TaskPackage {
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            task_id: self.task_id,
            unit: self.unit.label(),
        }
    }
}

/// Re-attachable reference to a dispatched task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: u64,
    /// Label of the work unit (or chunk) the task reads
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: u64,
    pub outputs: Vec<Value>,
    /// `end()` value of each worker-side reader, merged back in dispatch order
    #[serde(default)]
    pub readers: Vec<Value>,
}

/// Run one task package to completion in the calling thread
pub fn execute(package: &TaskPackage, registry: &Registry) -> LoopResult<TaskResult> {
    let mut composite = ReaderCollectorComposite::from_reader_states(&package.readers, registry)?;
    composite.begin()?;
    let outputs = composite.read_outputs(&package.unit)?;
    let readers = composite.end_readers()?;
    debug!(
        "Task {} read {} with {} reader(s)",
        package.task_id,
        package.unit.label(),
        outputs.len()
    );
    Ok(TaskResult {
        task_id: package.task_id,
        outputs,
        readers,
    })
}

pub(crate) async fn write_gz_json<T: Serialize>(path: &Path, value: &T) -> LoopResult<()> {
    let data = compress(&serde_json::to_vec(value)?)?;
    let temp_path = path.with_extension("tmp");
    tokio::fs::write(&temp_path, &data).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

pub(crate) async fn read_gz_json<T: DeserializeOwned>(path: &Path) -> LoopResult<T> {
    let data = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&decompress(&data)?)?)
}

/// Look for the outcome of a detached task in the working area
///
/// Returns `Ok(None)` while neither a result nor a failure file exists.
pub async fn check_result_files(
    area: &WorkingArea,
    handle: &TaskHandle,
) -> LoopResult<Option<TaskResult>> {
    let result_path = area.result_path(handle.task_id);
    if result_path.exists() {
        let result: TaskResult = read_gz_json(&result_path).await?;
        if result.task_id != handle.task_id {
            return Err(LoopError::TaskFailed {
                task_id: handle.task_id,
                unit: handle.unit.clone(),
                message: format!("result file holds task {}", result.task_id),
            });
        }
        return Ok(Some(result));
    }

    let failure_path = area.failure_path(handle.task_id);
    if failure_path.exists() {
        let message = tokio::fs::read_to_string(&failure_path).await?;
        return Err(LoopError::TaskFailed {
            task_id: handle.task_id,
            unit: handle.unit.clone(),
            message: message.trim().to_string(),
        });
    }

    Ok(None)
}

/// Worker side: run the task file at `task_path` and record the outcome
///
/// The working area is the grandparent of the task file. Exactly one of the
/// result or failure files is written.
pub async fn run_task_file(task_path: &Path, registry: &Registry) -> LoopResult<TaskResult> {
    let area = task_path
        .parent()
        .and_then(Path::parent)
        .map(WorkingArea::open)
        .ok_or_else(|| {
            LoopError::Config(format!(
                "task file {} is not inside a working area",
                task_path.display()
            ))
        })?;

    let package: TaskPackage = read_gz_json(task_path).await?;
    match execute(&package, registry) {
        Ok(result) => {
            write_gz_json(&area.result_path(package.task_id), &result).await?;
            Ok(result)
        }
        Err(e) => {
            tokio::fs::write(area.failure_path(package.task_id), format!("{}\n", e.chain())).await?;
            Err(e)
        }
    }
}

pub(crate) async fn write_task_file(area: &WorkingArea, package: &TaskPackage) -> LoopResult<()> {
    write_gz_json(&area.task_path(package.task_id), package).await
}
