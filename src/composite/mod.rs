//! Reader/collector fan-out
//!
//! A [`ReaderCollectorComposite`] holds an ordered list of (reader, collector)
//! pairs and presents them as one. Registration order is dispatch order at
//! every stage, and the i-th reader only ever feeds the i-th collector.

pub mod builtin;
pub mod registry;

pub use builtin::{FieldReader, FileCounter, ListCollector, SumCollector, UnitCounter};
pub use registry::{KindState, Registry};

use crate::error::{LoopError, LoopResult, Stage};
use crate::unit::WorkUnit;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Consumes work units and produces per-unit intermediate results
///
/// Implementations must be able to snapshot their state to JSON so that they
/// can be shipped to workers and written into checkpoints; the matching
/// constructor is registered in a [`Registry`] under [`Reader::kind`].
pub trait Reader: Send + Sync {
    fn kind(&self) -> &str;

    fn begin(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Process one unit; `Value::Null` means nothing to collect
    fn read(&mut self, unit: &WorkUnit) -> anyhow::Result<Value>;

    fn end(&mut self) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    /// Fold in the `end()` value of a copy of this reader that read units on
    /// a worker; called once per task, in dispatch order, before `end()`
    fn merge(&mut self, _finished: Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn snapshot(&self) -> anyhow::Result<Value>;
}

/// Folds a reader's intermediate results into an aggregate
pub trait Collector: Send + Sync {
    fn kind(&self) -> &str;

    fn collect(&mut self, partial: Value) -> anyhow::Result<()>;

    fn end(&mut self) -> anyhow::Result<Value>;

    fn snapshot(&self) -> anyhow::Result<Value>;
}

/// Serialized state of one (reader, collector) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberState {
    pub reader: KindState,
    pub collector: KindState,
}

/// Serialized state of a whole composite, in registration order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeState {
    pub members: Vec<MemberState>,
}

/// Final values produced by [`ReaderCollectorComposite::end`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeOutput {
    /// Value returned by each reader's `end()`, in registration order
    pub readers: Vec<Value>,
    /// Aggregated result of each collector, in registration order
    pub results: Vec<Value>,
}

struct Member {
    reader: Box<dyn Reader>,
    collector: Box<dyn Collector>,
}

/// Ordered list of (reader, collector) pairs behaving as a single pair
#[derive(Default)]
pub struct ReaderCollectorComposite {
    members: Vec<Member>,
}

impl std::fmt::Debug for ReaderCollectorComposite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.members
                    .iter()
                    .map(|m| (m.reader.kind().to_string(), m.collector.kind().to_string())),
            )
            .finish()
    }
}

impl ReaderCollectorComposite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pair; it will be dispatched after every pair added before it
    pub fn add<R, C>(&mut self, reader: R, collector: C)
    where
        R: Reader + 'static,
        C: Collector + 'static,
    {
        self.add_boxed(Box::new(reader), Box::new(collector));
    }

    pub fn add_boxed(&mut self, reader: Box<dyn Reader>, collector: Box<dyn Collector>) {
        self.members.push(Member { reader, collector });
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn begin(&mut self) -> LoopResult<()> {
        for (index, member) in self.members.iter_mut().enumerate() {
            member
                .reader
                .begin()
                .map_err(|e| reader_failure(Stage::Begin, index, &*member.reader, None, e))?;
        }
        Ok(())
    }

    /// Read one unit with every reader, then fold each output into its collector
    pub fn read(&mut self, unit: &WorkUnit) -> LoopResult<()> {
        let outputs = self.read_outputs(unit)?;
        self.collect_outputs(&unit.label(), outputs)
    }

    /// Reader half of [`read`](Self::read), as run on a worker
    pub fn read_outputs(&mut self, unit: &WorkUnit) -> LoopResult<Vec<Value>> {
        let mut outputs = Vec::with_capacity(self.members.len());
        for (index, member) in self.members.iter_mut().enumerate() {
            let output = member.reader.read(unit).map_err(|e| {
                reader_failure(Stage::Read, index, &*member.reader, Some(unit.label()), e)
            })?;
            outputs.push(output);
        }
        Ok(outputs)
    }

    /// Collector half of [`read`](Self::read): output i goes to collector i
    pub fn collect_outputs(&mut self, unit_label: &str, outputs: Vec<Value>) -> LoopResult<()> {
        if outputs.len() != self.members.len() {
            return Err(LoopError::InvalidState {
                component: "reader/collector composite",
                expected: "one output per member",
                actual: format!(
                    "{} outputs for {} members of '{}'",
                    outputs.len(),
                    self.members.len(),
                    unit_label
                ),
            });
        }

        for (index, (member, output)) in self.members.iter_mut().zip(outputs).enumerate() {
            if output.is_null() {
                continue;
            }
            member.collector.collect(output).map_err(|e| LoopError::MemberFailed {
                stage: Stage::Collect,
                role: "collector",
                index,
                kind: member.collector.kind().to_string(),
                unit: Some(unit_label.to_string()),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Fold the reader `end()` values returned by one task into the readers
    pub fn merge_readers(&mut self, unit_label: &str, finished: Vec<Value>) -> LoopResult<()> {
        if finished.len() != self.members.len() {
            return Err(LoopError::InvalidState {
                component: "reader/collector composite",
                expected: "one finished reader per member",
                actual: format!(
                    "{} finished readers for {} members of '{}'",
                    finished.len(),
                    self.members.len(),
                    unit_label
                ),
            });
        }

        for (index, (member, value)) in self.members.iter_mut().zip(finished).enumerate() {
            member.reader.merge(value).map_err(|e| {
                reader_failure(
                    Stage::Merge,
                    index,
                    &*member.reader,
                    Some(unit_label.to_string()),
                    e,
                )
            })?;
        }
        Ok(())
    }

    /// Reader half of [`end`](Self::end), as run on a worker
    pub fn end_readers(&mut self) -> LoopResult<Vec<Value>> {
        let mut readers = Vec::with_capacity(self.members.len());
        for (index, member) in self.members.iter_mut().enumerate() {
            let value = member
                .reader
                .end()
                .map_err(|e| reader_failure(Stage::End, index, &*member.reader, None, e))?;
            readers.push(value);
        }
        Ok(readers)
    }

    /// End every reader, then every collector, in registration order
    pub fn end(&mut self) -> LoopResult<CompositeOutput> {
        let readers = self.end_readers()?;

        let mut results = Vec::with_capacity(self.members.len());
        for (index, member) in self.members.iter_mut().enumerate() {
            let value = member.collector.end().map_err(|e| LoopError::MemberFailed {
                stage: Stage::End,
                role: "collector",
                index,
                kind: member.collector.kind().to_string(),
                unit: None,
                source: e,
            })?;
            results.push(value);
        }

        debug!("Composite of {} member(s) ended", self.members.len());
        Ok(CompositeOutput { readers, results })
    }

    /// Snapshot of the reader side only, as shipped inside task packages
    pub fn reader_states(&self) -> LoopResult<Vec<KindState>> {
        self.members
            .iter()
            .enumerate()
            .map(|(index, m)| {
                KindState::of_reader(&*m.reader)
                    .map_err(|e| reader_failure(Stage::Snapshot, index, &*m.reader, None, e))
            })
            .collect()
    }

    pub fn snapshot(&self) -> LoopResult<CompositeState> {
        let mut members = Vec::with_capacity(self.members.len());
        for (index, m) in self.members.iter().enumerate() {
            let reader = KindState::of_reader(&*m.reader)
                .map_err(|e| reader_failure(Stage::Snapshot, index, &*m.reader, None, e))?;
            let collector =
                KindState::of_collector(&*m.collector).map_err(|e| LoopError::MemberFailed {
                    stage: Stage::Snapshot,
                    role: "collector",
                    index,
                    kind: m.collector.kind().to_string(),
                    unit: None,
                    source: e,
                })?;
            members.push(MemberState { reader, collector });
        }
        Ok(CompositeState { members })
    }

    /// Rebuild a composite from a snapshot, preserving member order
    pub fn restore(state: &CompositeState, registry: &Registry) -> LoopResult<Self> {
        let mut composite = Self::new();
        for (index, member) in state.members.iter().enumerate() {
            let reader = registry.build_reader(index, &member.reader)?;
            let collector = registry.build_collector(index, &member.collector)?;
            composite.add_boxed(reader, collector);
        }
        Ok(composite)
    }

    /// Build a reader-only composite for a worker; collectors are never run there
    pub fn from_reader_states(states: &[KindState], registry: &Registry) -> LoopResult<Self> {
        let mut composite = Self::new();
        for (index, state) in states.iter().enumerate() {
            composite.add_boxed(
                registry.build_reader(index, state)?,
                Box::new(ListCollector::default()),
            );
        }
        Ok(composite)
    }
}

fn reader_failure(
    stage: Stage,
    index: usize,
    reader: &dyn Reader,
    unit: Option<String>,
    source: anyhow::Error,
) -> LoopError {
    LoopError::MemberFailed {
        stage,
        role: "reader",
        index,
        kind: reader.kind().to_string(),
        unit,
        source,
    }
}
