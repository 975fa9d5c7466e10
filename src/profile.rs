//! Wall-clock profile of a run's stages

use crate::error::LoopResult;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone)]
pub struct StageTiming {
    pub stage: String,
    pub elapsed: Duration,
}

/// Collects per-stage timings and renders them slowest first
#[derive(Debug, Default)]
pub struct Profiler {
    timings: Vec<StageTiming>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the time since `started` against `stage`
    pub fn record_since(&mut self, stage: impl Into<String>, started: Instant) {
        self.record(stage, started.elapsed());
    }

    pub fn record(&mut self, stage: impl Into<String>, elapsed: Duration) {
        self.timings.push(StageTiming {
            stage: stage.into(),
            elapsed,
        });
    }

    pub fn timings(&self) -> &[StageTiming] {
        &self.timings
    }

    pub fn total(&self) -> Duration {
        self.timings.iter().map(|t| t.elapsed).sum()
    }

    /// Table of stages sorted by elapsed time, slowest first
    pub fn render(&self) -> String {
        let mut sorted = self.timings.clone();
        sorted.sort_by(|a, b| b.elapsed.cmp(&a.elapsed));

        let total = self.total().as_secs_f64();
        let width = sorted
            .iter()
            .map(|t| t.stage.len())
            .max()
            .unwrap_or(0)
            .max("stage".len());

        let mut out = format!("{:<width$}  {:>12}  {:>7}\n", "stage", "seconds", "share");
        for timing in &sorted {
            let secs = timing.elapsed.as_secs_f64();
            let share = if total > 0.0 { 100.0 * secs / total } else { 0.0 };
            out.push_str(&format!(
                "{:<width$}  {:>12.6}  {:>6.1}%\n",
                timing.stage, secs, share
            ));
        }
        out.push_str(&format!("{:<width$}  {:>12.6}\n", "total", total));
        out
    }

    /// Write the table to `out_path`, or print it when no path is given
    pub fn write(&self, out_path: Option<&Path>) -> LoopResult<()> {
        let table = self.render();
        match out_path {
            Some(path) => {
                std::fs::write(path, table)?;
                info!("Wrote profile to {}", path.display());
            }
            None => print!("{table}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_render_sorts_slowest_first() {
        let mut profiler = Profiler::new();
        profiler.record("begin", Duration::from_millis(5));
        profiler.record("read TTJets", Duration::from_millis(300));
        profiler.record("end", Duration::from_millis(40));

        let table = profiler.render();
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("stage"));
        assert!(lines[1].starts_with("read TTJets"));
        assert!(lines[2].starts_with("end"));
        assert!(lines[3].starts_with("begin"));
        assert!(lines[4].starts_with("total"));
        assert_eq!(profiler.total(), Duration::from_millis(345));
    }

    #[test]
    fn test_write_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("profile.txt");
        let mut profiler = Profiler::new();
        profiler.record_since("checkpoint", Instant::now());
        profiler.write(Some(&path)).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("checkpoint"));
    }
}
