//! Detached worker: executes one task file from a working area

use batchloop::logging::init_logging;
use batchloop::parallel::task::run_task_file;
use batchloop::working_area::{WorkingArea, MODULE_PATH_ENV};
use batchloop::{LoopResult, Registry};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "batchloop-worker")]
#[command(about = "Execute one batchloop task file", long_about = None)]
struct Cli {
    /// Task file inside a working area's tasks directory
    task: PathBuf,

    /// Bound on waiting for another process's module extraction
    #[arg(long, value_name = "SECS", default_value_t = 600)]
    lock_timeout: u64,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

async fn run(cli: &Cli) -> LoopResult<()> {
    let mut registry = Registry::with_builtins();
    registry.inherit_search_path(std::env::var_os(MODULE_PATH_ENV));

    if let Some(root) = cli.task.parent().and_then(Path::parent) {
        let area = WorkingArea::open(root);
        area.ensure_extracted(Duration::from_secs(cli.lock_timeout))
            .await?;
        let modules_dir = area.modules_dir();
        if modules_dir.is_dir() {
            registry.prepend_search_path(&modules_dir);
        }
    }

    let result = run_task_file(&cli.task, &registry).await?;
    info!("Task {} finished", result.task_id);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(&cli).await {
        error!("Task {} failed: {}", cli.task.display(), e.chain());
        std::process::exit(e.exit_code());
    }
}
