//! # batchloop
//!
//! Runs a set of readers over a list of work units, fans the per-unit work
//! out to an execution backend and folds the results through paired
//! collectors. Runs on a detached backend leave a checkpoint that
//! `batchloop-resume` can finish from another process.
//!
//! ## Modules
//!
//! - `composite` - Reader/collector pairs driven as one
//! - `parallel` - Execution facade and its in-process, subprocess and HTCondor backends
//! - `loops` - Plain and resumable loop controllers
//! - `resume` - Finishing a checkpointed run
//! - `working_area` - Directory layout and one-time module extraction
//! - `checkpoint` - Compressed, versioned state files
//! - `framework` - Top-level run driver with interrupt handling
//! - `config` - Run configuration from TOML and the environment
//! - `subprocess` - Process runner abstraction for scheduler commands
pub mod checkpoint;
pub mod composite;
pub mod config;
pub mod context;
pub mod error;
pub mod framework;
pub mod interaction;
pub mod logging;
pub mod loops;
pub mod parallel;
pub mod profile;
pub mod resume;
pub mod subprocess;
pub mod unit;
pub mod working_area;

pub use composite::{
    Collector, CompositeOutput, KindState, Reader, ReaderCollectorComposite, Registry,
};
pub use config::RunConfig;
pub use context::RunContext;
pub use error::{LoopError, LoopResult, Stage};
pub use framework::{Framework, RunOutcome};
pub use loops::{Checkpointable, PipelineState, ResumableLoop, UnitLoop, UnitReader};
pub use parallel::{ExecutionBackend, ParallelExecution, ParallelMode};
pub use resume::Resume;
pub use unit::{SplitPolicy, WorkUnit};
pub use working_area::WorkingArea;
