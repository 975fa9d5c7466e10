//! Task progress owned by the execution facade

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Submitted vs. completed task counts at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub submitted: usize,
    pub completed: usize,
}

impl ProgressReport {
    pub fn outstanding(&self) -> usize {
        self.submitted.saturating_sub(self.completed)
    }
}

/// Receives progress reports
pub trait ProgressSink: Send + Sync {
    fn report(&self, report: ProgressReport);

    fn finish(&self) {}
}

/// Discards every report (quiet mode)
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _report: ProgressReport) {}
}

/// Terminal progress bar
pub struct BarSink {
    bar: ProgressBar,
}

impl Default for BarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BarSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} tasks")
        {
            bar.set_style(style.progress_chars("##-"));
        }
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }
}

impl ProgressSink for BarSink {
    fn report(&self, report: ProgressReport) {
        self.bar.set_length(report.submitted as u64);
        self.bar.set_position(report.completed as u64);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Monotonic task counters shared by the facade and its reporter sink
#[derive(Clone)]
pub struct ProgressMonitor {
    submitted: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for ProgressMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressMonitor")
            .field("report", &self.report())
            .finish()
    }
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        Self::new(Arc::new(NullSink))
    }
}

impl ProgressMonitor {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            submitted: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
            sink,
        }
    }

    pub fn task_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::AcqRel);
        self.sink.report(self.report());
    }

    pub fn task_completed(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
        self.sink.report(self.report());
    }

    /// Count tasks that were submitted by an earlier process
    pub fn tasks_inherited(&self, count: usize) {
        self.submitted.fetch_add(count, Ordering::AcqRel);
        self.sink.report(self.report());
    }

    pub fn report(&self) -> ProgressReport {
        ProgressReport {
            submitted: self.submitted.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
        }
    }

    pub fn finish(&self) {
        self.sink.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<ProgressReport>>,
    }

    impl ProgressSink for RecordingSink {
        fn report(&self, report: ProgressReport) {
            self.reports.lock().unwrap().push(report);
        }
    }

    #[test]
    fn test_reports_are_monotonic() {
        let sink = Arc::new(RecordingSink::default());
        let monitor = ProgressMonitor::new(sink.clone());
        monitor.task_submitted();
        monitor.task_submitted();
        monitor.task_completed();
        monitor.task_completed();

        let reports = sink.reports.lock().unwrap().clone();
        assert_eq!(reports.len(), 4);
        for pair in reports.windows(2) {
            assert!(pair[1].completed >= pair[0].completed);
            assert!(pair[1].submitted >= pair[0].submitted);
        }
        assert_eq!(monitor.report().outstanding(), 0);
    }

    #[test]
    fn test_inherited_tasks_count_as_submitted() {
        let monitor = ProgressMonitor::default();
        monitor.tasks_inherited(3);
        monitor.task_completed();
        assert_eq!(
            monitor.report(),
            ProgressReport {
                submitted: 3,
                completed: 1
            }
        );
    }
}
