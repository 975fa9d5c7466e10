//! Per-run context
//!
//! Everything a run would otherwise take from process-wide state: its id,
//! the interrupt flag, the operator prompt and where progress goes. Two runs
//! in one process each get their own.

use crate::interaction::{InterruptSignal, StdinPrompter, UserPrompter};
use crate::parallel::{BarSink, NullSink, ProgressMonitor, ProgressSink};
use std::sync::Arc;
use tracing::{info_span, Span};
use uuid::Uuid;

#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub interrupt: InterruptSignal,
    pub prompter: Arc<dyn UserPrompter>,
    pub progress_sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("interrupted", &self.interrupt.is_triggered())
            .finish()
    }
}

impl RunContext {
    /// Context for an interactive terminal session
    pub fn interactive(quiet: bool) -> Self {
        let progress_sink: Arc<dyn ProgressSink> = if quiet {
            Arc::new(NullSink)
        } else {
            Arc::new(BarSink::new())
        };
        Self {
            run_id: Uuid::new_v4(),
            interrupt: InterruptSignal::new(),
            prompter: Arc::new(StdinPrompter::new()),
            progress_sink,
        }
    }

    /// Context with an explicit prompter and no progress output
    pub fn with_prompter(prompter: Arc<dyn UserPrompter>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            interrupt: InterruptSignal::new(),
            prompter,
            progress_sink: Arc::new(NullSink),
        }
    }

    pub fn progress_monitor(&self) -> ProgressMonitor {
        ProgressMonitor::new(self.progress_sink.clone())
    }

    pub fn span(&self) -> Span {
        info_span!("run", id = %self.run_id)
    }
}
