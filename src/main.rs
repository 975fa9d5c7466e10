use batchloop::logging::init_logging;
use batchloop::{LoopError, Registry, Resume};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

/// Finish a checkpointed batch loop and print its results
#[derive(Parser)]
#[command(name = "batchloop-resume")]
#[command(about = "Resume a checkpointed batch loop and print its results as JSON", long_about = None)]
struct Cli {
    /// Checkpoint file written by the interrupted run
    checkpoint: PathBuf,

    /// Bound on waiting for another process's module extraction
    #[arg(long, value_name = "SECS")]
    lock_timeout: Option<u64>,

    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut resume = Resume::new(Registry::with_builtins());
    if let Some(secs) = cli.lock_timeout {
        resume = resume.with_lock_timeout(Duration::from_secs(secs));
    }

    let result = match resume.run(&cli.checkpoint).await {
        Ok(output) => serde_json::to_string_pretty(&output).map_err(LoopError::from),
        Err(e) => Err(e),
    };

    match result {
        Ok(json) => println!("{json}"),
        Err(e) => {
            error!("Resume failed: {}", e.chain());
            eprintln!("Error: {}", e.chain());
            std::process::exit(e.exit_code());
        }
    }
}
