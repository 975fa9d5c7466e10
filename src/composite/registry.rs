//! Registry of serializable reader and collector kinds
//!
//! Readers and collectors cross process boundaries as `(kind, state)` pairs.
//! A process can only rebuild the kinds it has registered, so the worker and
//! resume binaries of a custom analysis register their own kinds on top of the
//! built-in ones.

use super::builtin::{FieldReader, FileCounter, ListCollector, SumCollector, UnitCounter};
use super::{Collector, Reader};
use crate::error::{LoopError, LoopResult, Stage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Kind tag plus opaque JSON state of one reader or collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindState {
    pub kind: String,
    pub state: Value,
}

impl KindState {
    pub fn of_reader(reader: &dyn Reader) -> anyhow::Result<Self> {
        Ok(Self {
            kind: reader.kind().to_string(),
            state: reader.snapshot()?,
        })
    }

    pub fn of_collector(collector: &dyn Collector) -> anyhow::Result<Self> {
        Ok(Self {
            kind: collector.kind().to_string(),
            state: collector.snapshot()?,
        })
    }
}

type ReaderFactory = Box<dyn Fn(Value) -> anyhow::Result<Box<dyn Reader>> + Send + Sync>;
type CollectorFactory = Box<dyn Fn(Value) -> anyhow::Result<Box<dyn Collector>> + Send + Sync>;

/// Constructors for every reader/collector kind this process can rebuild
#[derive(Default)]
pub struct Registry {
    readers: HashMap<String, ReaderFactory>,
    collectors: HashMap<String, CollectorFactory>,
    search_path: Vec<PathBuf>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut readers: Vec<_> = self.readers.keys().collect();
        let mut collectors: Vec<_> = self.collectors.keys().collect();
        readers.sort();
        collectors.sort();
        f.debug_struct("Registry")
            .field("readers", &readers)
            .field("collectors", &collectors)
            .field("search_path", &self.search_path)
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the kinds shipped in this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_reader::<UnitCounter>("unit_counter");
        registry.register_reader::<FileCounter>("file_counter");
        registry.register_reader::<FieldReader>("field");
        registry.register_collector::<SumCollector>("sum");
        registry.register_collector::<ListCollector>("list");
        registry
    }

    /// Register a reader whose snapshot is its own serde representation
    pub fn register_reader<R>(&mut self, kind: &str)
    where
        R: Reader + DeserializeOwned + 'static,
    {
        self.register_reader_with(kind, |state| {
            let reader: R = serde_json::from_value(state)?;
            Ok(Box::new(reader) as Box<dyn Reader>)
        });
    }

    pub fn register_reader_with<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(Value) -> anyhow::Result<Box<dyn Reader>> + Send + Sync + 'static,
    {
        self.readers.insert(kind.to_string(), Box::new(factory));
    }

    pub fn register_collector<C>(&mut self, kind: &str)
    where
        C: Collector + DeserializeOwned + 'static,
    {
        self.register_collector_with(kind, |state| {
            let collector: C = serde_json::from_value(state)?;
            Ok(Box::new(collector) as Box<dyn Collector>)
        });
    }

    pub fn register_collector_with<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(Value) -> anyhow::Result<Box<dyn Collector>> + Send + Sync + 'static,
    {
        self.collectors.insert(kind.to_string(), Box::new(factory));
    }

    /// Build the reader at position `index` of a composite
    pub fn build_reader(&self, index: usize, state: &KindState) -> LoopResult<Box<dyn Reader>> {
        let factory = self
            .readers
            .get(&state.kind)
            .ok_or_else(|| LoopError::UnknownKind {
                role: "reader",
                kind: state.kind.clone(),
            })?;
        factory(state.state.clone()).map_err(|e| LoopError::MemberFailed {
            stage: Stage::Restore,
            role: "reader",
            index,
            kind: state.kind.clone(),
            unit: None,
            source: e,
        })
    }

    pub fn build_collector(&self, index: usize, state: &KindState) -> LoopResult<Box<dyn Collector>> {
        let factory = self
            .collectors
            .get(&state.kind)
            .ok_or_else(|| LoopError::UnknownKind {
                role: "collector",
                kind: state.kind.clone(),
            })?;
        factory(state.state.clone()).map_err(|e| LoopError::MemberFailed {
            stage: Stage::Restore,
            role: "collector",
            index,
            kind: state.kind.clone(),
            unit: None,
            source: e,
        })
    }

    /// Put a directory at the front of the module search path
    pub fn prepend_search_path(&mut self, dir: &Path) {
        self.search_path.retain(|p| p != dir);
        self.search_path.insert(0, dir.to_path_buf());
    }

    /// Append the entries of an inherited search path value not already present
    pub fn inherit_search_path(&mut self, value: Option<OsString>) {
        let Some(value) = value else {
            return;
        };
        for dir in std::env::split_paths(&value) {
            if !dir.as_os_str().is_empty() && !self.search_path.contains(&dir) {
                self.search_path.push(dir);
            }
        }
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }
}
