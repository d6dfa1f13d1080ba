//! Lakeload CLI - Main entry point

use clap::Parser;
use lakeload_cli::{check, check_exit_code, execute, exit_code, Cli, EXIT_FAILURE};
use lakeload_common::logging::init_logging;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.log_config() {
        Ok(log_config) => {
            if let Err(e) = init_logging(&log_config) {
                eprintln!("Warning: failed to initialize logging: {}", e);
            }
        },
        Err(e) => eprintln!("Warning: invalid logging configuration: {}", e),
    }

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };

    if cli.check {
        let report = match check(&cli, cancel).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Checks could not start");
                eprintln!("Error: {:#}", e);
                process::exit(EXIT_FAILURE);
            },
        };
        interrupt.abort();
        println!("{}", report.summary());
        process::exit(check_exit_code(&report));
    }

    let result = match execute(&cli, cancel).await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Run could not start");
            eprintln!("Error: {:#}", e);
            process::exit(EXIT_FAILURE);
        },
    };
    interrupt.abort();

    println!("{}", result.summary());

    if let Some(path) = &cli.output {
        match result.write_json(path) {
            Ok(()) => info!("Run report written to {}", path.display()),
            Err(e) => {
                error!(error = %e, "Failed to write run report");
                eprintln!("Error: failed to write {}: {}", path.display(), e);
                process::exit(EXIT_FAILURE);
            },
        }
    }

    process::exit(exit_code(&result));
}
