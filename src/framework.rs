//! Top-level run driver
//!
//! [`Framework::run`] wires a composite to the configured backend, drives the
//! loop over the work units and owns the interrupt decision: on an interrupt
//! the operator is asked whether to terminate running jobs, and the default
//! answer lets the run carry on.

use crate::composite::{CompositeOutput, ReaderCollectorComposite, Registry};
use crate::config::RunConfig;
use crate::context::RunContext;
use crate::error::{LoopError, LoopResult};
use crate::loops::{DispatchingReader, ResumableLoop, UnitLoop};
use crate::parallel::{ExecutionBackend, ParallelExecution, SharedExecution};
use crate::profile::Profiler;
use crate::subprocess::{ProcessRunner, TokioProcessRunner};
use crate::unit::WorkUnit;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn, Instrument};

const TERMINATE_PROMPT: &str = "terminate running jobs";

#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        output: CompositeOutput,
        /// Checkpoint written by a detached run
        checkpoint: Option<PathBuf>,
    },
    /// The operator chose to terminate running jobs after an interrupt
    Interrupted { checkpoint: Option<PathBuf> },
}

impl RunOutcome {
    pub fn output(&self) -> Option<&CompositeOutput> {
        match self {
            RunOutcome::Completed { output, .. } => Some(output),
            RunOutcome::Interrupted { .. } => None,
        }
    }

    /// Final output, or [`LoopError::Interrupted`] for a terminated run
    pub fn into_output(self) -> LoopResult<CompositeOutput> {
        match self {
            RunOutcome::Completed { output, .. } => Ok(output),
            RunOutcome::Interrupted { .. } => Err(LoopError::Interrupted),
        }
    }

    pub fn checkpoint(&self) -> Option<&PathBuf> {
        match self {
            RunOutcome::Completed { checkpoint, .. } | RunOutcome::Interrupted { checkpoint, .. } => {
                checkpoint.as_ref()
            }
        }
    }
}

pub struct Framework {
    config: RunConfig,
    context: RunContext,
    registry: Arc<Registry>,
    runner: Arc<dyn ProcessRunner>,
    backend: Option<Box<dyn ExecutionBackend>>,
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("config", &self.config)
            .field("context", &self.context)
            .finish()
    }
}

impl Framework {
    pub fn new(config: RunConfig, context: RunContext) -> LoopResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            context,
            registry: Arc::new(Registry::with_builtins()),
            runner: Arc::new(TokioProcessRunner),
            backend: None,
        })
    }

    /// Kinds available to in-process workers
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Use `backend` instead of the one the configuration selects
    pub fn with_backend(mut self, backend: Box<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Route SIGINT/SIGTERM to this run's interrupt flag
    pub fn handle_os_signals(self) -> LoopResult<Self> {
        self.context.interrupt.install_os_handler()?;
        Ok(self)
    }

    pub async fn run(
        &mut self,
        units: &[WorkUnit],
        composite: ReaderCollectorComposite,
    ) -> LoopResult<RunOutcome> {
        let span = self.context.span();
        self.run_inner(units, composite).instrument(span).await
    }

    async fn run_inner(
        &mut self,
        units: &[WorkUnit],
        composite: ReaderCollectorComposite,
    ) -> LoopResult<RunOutcome> {
        let mut profiler = self.config.profile.then(Profiler::new);
        let progress = self.context.progress_monitor();
        let execution = match self.backend.take() {
            Some(backend) => ParallelExecution::new(backend, progress),
            None => ParallelExecution::from_config(
                &self.config,
                self.registry.clone(),
                self.runner.clone(),
                progress,
            )?,
        };

        let checkpoint_path = match execution.descriptor() {
            Some(_) => execution.working_area().map(|area| area.checkpoint_path()),
            None => None,
        };
        info!(
            "Running {} work unit(s) on {} backend",
            units.len(),
            execution.backend_name()
        );

        let execution = execution.into_shared();
        let started = Instant::now();
        execution.lock().await.begin().await?;
        record(&mut profiler, "begin", started);

        let reader =
            DispatchingReader::new(composite, self.config.split_policy(), execution.clone());
        let mut driven = Box::pin(drive(
            reader,
            units,
            checkpoint_path.clone(),
            &mut profiler,
        ));

        let interrupt = self.context.interrupt.clone();
        let finished = loop {
            tokio::select! {
                result = &mut driven => break Some(result),
                _ = interrupt.triggered() => {
                    warn!("received interrupt");
                    let terminate = match self
                        .context
                        .prompter
                        .prompt_yes_no(TERMINATE_PROMPT, false)
                        .await
                    {
                        Ok(answer) => answer,
                        Err(e) => {
                            warn!("Could not ask whether to terminate: {}", e);
                            false
                        }
                    };
                    interrupt.reset();
                    if terminate {
                        info!("terminating running jobs");
                        break None;
                    }
                    info!("not terminating running jobs");
                }
            }
        };
        drop(driven);

        let outcome = match finished {
            None => {
                shutdown(&execution, true).await?;
                Ok(RunOutcome::Interrupted {
                    checkpoint: checkpoint_path.filter(|path| path.exists()),
                })
            }
            Some(Err(e)) => {
                error!("Run failed: {}", e);
                if let Err(cleanup) = shutdown(&execution, true).await {
                    warn!("Cleanup after failure failed: {}", cleanup);
                }
                Err(e)
            }
            Some(Ok(output)) => {
                let started = Instant::now();
                shutdown(&execution, false).await?;
                record(&mut profiler, "end backend", started);
                Ok(RunOutcome::Completed {
                    output,
                    checkpoint: checkpoint_path,
                })
            }
        };

        if let Some(profiler) = &profiler {
            profiler.write(self.config.profile_out_path.as_deref())?;
        }
        outcome
    }
}

fn record(profiler: &mut Option<Profiler>, stage: &str, started: Instant) {
    if let Some(profiler) = profiler {
        profiler.record_since(stage, started);
    }
}

async fn shutdown(execution: &SharedExecution, terminate: bool) -> LoopResult<()> {
    let mut execution = execution.lock().await;
    if terminate {
        execution.terminate().await?;
    }
    execution.end().await
}

/// Read every unit, checkpoint when the backend is detached, then end
async fn drive(
    reader: DispatchingReader,
    units: &[WorkUnit],
    checkpoint_path: Option<PathBuf>,
    profiler: &mut Option<Profiler>,
) -> LoopResult<CompositeOutput> {
    match checkpoint_path {
        Some(path) => {
            let mut resumable = ResumableLoop::new(reader, path);
            let started = Instant::now();
            resumable.begin().await?;
            record(profiler, "begin readers", started);
            for unit in units {
                let started = Instant::now();
                resumable.read(unit).await?;
                record(profiler, &format!("read {}", unit.name), started);
            }
            let started = Instant::now();
            resumable.checkpoint().await?;
            record(profiler, "checkpoint", started);
            let started = Instant::now();
            let output = resumable.end().await?;
            record(profiler, "end", started);
            Ok(output)
        }
        None => {
            let mut unit_loop = UnitLoop::new(reader);
            let started = Instant::now();
            unit_loop.begin().await?;
            record(profiler, "begin readers", started);
            for unit in units {
                let started = Instant::now();
                unit_loop.read(unit).await?;
                record(profiler, &format!("read {}", unit.name), started);
            }
            let started = Instant::now();
            let output = unit_loop.end().await?;
            record(profiler, "end", started);
            Ok(output)
        }
    }
}
