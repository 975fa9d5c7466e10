//! Work units and their split into per-task chunks

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Position of a chunk within the work unit it was split from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: usize,
    pub count: usize,
}

/// One dataset or component to be processed independently
///
/// Work units are owned by the caller and passed through the pipeline by
/// value; the orchestration layer never mutates one in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub name: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Cap on events to process from this unit (or chunk)
    #[serde(default)]
    pub max_events: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub chunk: Option<ChunkInfo>,
}

impl WorkUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: Vec::new(),
            max_events: None,
            metadata: BTreeMap::new(),
            chunk: None,
        }
    }

    pub fn with_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_max_events(mut self, max_events: u64) -> Self {
        self.max_events = Some(max_events);
        self
    }

    /// True for an unsplit unit or the first chunk of a split one
    ///
    /// Per-unit quantities (metadata fields, unit counts) must be contributed
    /// once per unit, not once per chunk.
    pub fn is_primary_chunk(&self) -> bool {
        self.chunk.map(|c| c.index == 0).unwrap_or(true)
    }

    /// Label used in logs and error messages
    pub fn label(&self) -> String {
        match self.chunk {
            Some(c) if c.count > 1 => format!("{} [{}/{}]", self.name, c.index + 1, c.count),
            _ => self.name.clone(),
        }
    }
}

/// Convert the conventional "-1 means unlimited" integer option
pub fn limit_from(value: i64) -> Option<u64> {
    (value >= 0).then_some(value as u64)
}

/// Limits used when splitting a work unit into per-process tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPolicy {
    pub max_files_per_dataset: Option<u64>,
    pub max_files_per_process: Option<u64>,
    pub max_events_per_dataset: Option<u64>,
    pub max_events_per_process: Option<u64>,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            max_files_per_dataset: None,
            max_files_per_process: Some(1),
            max_events_per_dataset: None,
            max_events_per_process: None,
        }
    }
}

impl SplitPolicy {
    /// Policy that never splits
    pub fn whole() -> Self {
        Self {
            max_files_per_process: None,
            ..Self::default()
        }
    }

    /// Split a unit into chunks, preserving file order
    ///
    /// A unit without files, or a policy without a per-process file limit,
    /// yields a single chunk. Event caps are propagated: the per-process cap
    /// bounds each chunk and the per-dataset cap bounds the unit as a whole.
    pub fn split(&self, unit: &WorkUnit) -> Vec<WorkUnit> {
        let mut files = unit.files.clone();
        if let Some(max) = self.max_files_per_dataset {
            files.truncate(max as usize);
        }

        let dataset_events = min_option(unit.max_events, self.max_events_per_dataset);
        let chunk_events = min_option(dataset_events, self.max_events_per_process);

        let groups: Vec<Vec<PathBuf>> = match self.max_files_per_process {
            Some(per) if per > 0 && !files.is_empty() => {
                files.chunks(per as usize).map(|c| c.to_vec()).collect()
            }
            _ => vec![files],
        };

        let count = groups.len();
        groups
            .into_iter()
            .enumerate()
            .map(|(index, files)| WorkUnit {
                name: unit.name.clone(),
                files,
                max_events: chunk_events,
                metadata: unit.metadata.clone(),
                chunk: Some(ChunkInfo { index, count }),
            })
            .collect()
    }
}

fn min_option(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
