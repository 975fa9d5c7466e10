//! Built-in reader and collector kinds

use super::{Collector, Reader};
use crate::unit::WorkUnit;
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Counts work units (once per unit, however it was split)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitCounter;

impl Reader for UnitCounter {
    fn kind(&self) -> &str {
        "unit_counter"
    }

    fn read(&mut self, unit: &WorkUnit) -> anyhow::Result<Value> {
        Ok(json!(u64::from(unit.is_primary_chunk())))
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Counts the input files of each unit or chunk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileCounter;

impl Reader for FileCounter {
    fn kind(&self) -> &str {
        "file_counter"
    }

    fn read(&mut self, unit: &WorkUnit) -> anyhow::Result<Value> {
        Ok(json!(unit.files.len()))
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Extracts one metadata field per unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldReader {
    pub field: String,
}

impl FieldReader {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Reader for FieldReader {
    fn kind(&self) -> &str {
        "field"
    }

    fn read(&mut self, unit: &WorkUnit) -> anyhow::Result<Value> {
        if !unit.is_primary_chunk() {
            return Ok(Value::Null);
        }
        unit.metadata
            .get(&self.field)
            .cloned()
            .ok_or_else(|| anyhow!("work unit has no metadata field '{}'", self.field))
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Sums numeric partial results
///
/// The result stays an integer as long as every input was one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SumCollector {
    integer: i64,
    float: f64,
    saw_float: bool,
}

impl Collector for SumCollector {
    fn kind(&self) -> &str {
        "sum"
    }

    fn collect(&mut self, partial: Value) -> anyhow::Result<()> {
        if let Some(n) = partial.as_i64() {
            self.integer = self
                .integer
                .checked_add(n)
                .context("integer sum overflowed")?;
        } else if let Some(x) = partial.as_f64() {
            self.float += x;
            self.saw_float = true;
        } else {
            anyhow::bail!("cannot sum non-numeric value {}", partial);
        }
        Ok(())
    }

    fn end(&mut self) -> anyhow::Result<Value> {
        if self.saw_float {
            Ok(json!(self.integer as f64 + self.float))
        } else {
            Ok(json!(self.integer))
        }
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Keeps every partial result, in fold order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListCollector {
    items: Vec<Value>,
}

impl Collector for ListCollector {
    fn kind(&self) -> &str {
        "list"
    }

    fn collect(&mut self, partial: Value) -> anyhow::Result<()> {
        self.items.push(partial);
        Ok(())
    }

    fn end(&mut self) -> anyhow::Result<Value> {
        Ok(Value::Array(self.items.clone()))
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
