//! # NetBox Stress - Main Entry Point
//!
//! 1. **Parse arguments** and initialize logging
//! 2. **Resolve configuration**: protocol defaults, validation (fatal on error)
//! 3. **Run**: spawn the virtual clients; Ctrl-C triggers a cooperative stop
//! 4. **Report**: console summary and optional JSON output
//!
//! Per-client failures never make the process fail; they are part of the
//! report. Only invalid configuration or unwritable output does.

use anyhow::Result;
use clap::Parser;
use netbox_stress::{
    benchmark::{BenchmarkRunner, RunConfig, StopSignal},
    cli::Args,
    logging,
    results::{ResultsManager, RunResults},
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Held until exit so buffered file logs are flushed
    let _log_guard = logging::init(args.verbose, args.quiet, args.log_file.as_deref())?;

    info!("Starting NetBox Stress v{}", netbox_stress::VERSION);

    let config = RunConfig::from_args(&args)?;
    let stop = StopSignal::new();

    let signal = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, stopping clients...");
                signal.trigger();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let runner = BenchmarkRunner::new(config, stop.clone())?;
    let snapshot = runner.run().await?;

    if stop.is_stopped() {
        warn!("Run was interrupted; results cover the work done before the stop");
    }

    let results = RunResults::new(runner.config(), snapshot);
    ResultsManager::new(args.output_file.as_deref(), args.error_sample).finalize(&results)?;

    info!("NetBox Stress completed");
    Ok(())
}
