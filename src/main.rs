//! Coil test runner.
//!
//! ```text
//! coil_daq --run-id coil_07
//! coil_daq --config bench_b.toml --simulate
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use coil_daq::app::{execute_run, log_path, validate_run_id};
use coil_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use coil_daq::instruments::Instruments;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "coil_daq", version, about = "Coil ramp control and continuous acquisition")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run identifier; the log is written to <output_dir>/<run-id>.csv
    #[arg(short, long)]
    run_id: Option<String>,

    /// Use simulated instruments instead of the bench
    #[arg(long)]
    simulate: bool,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    init_tracing(&settings.application.log_level);

    let mut stdin = BufReader::new(tokio::io::stdin());
    let run_id = match cli.run_id {
        Some(id) => id,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(b"Enter run id: ").await?;
            stdout.flush().await?;
            let mut line = String::new();
            stdin.read_line(&mut line).await?;
            line
        }
    };
    let run_id = validate_run_id(&run_id)?.to_string();
    info!(run_id = %run_id, log = %log_path(&settings, &run_id).display(), simulate = cli.simulate, "Starting run");

    let instruments = if cli.simulate {
        Instruments::simulated(&settings).0
    } else {
        Instruments::open(&settings)
            .await
            .context("Failed to open instrument sessions")?
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for interrupt");
            // dropping the sender would stop the run
            std::future::pending::<()>().await;
        }
        info!("Interrupt received, stopping acquisition");
        let _ = stop_tx.send(true);
    });

    let summary = execute_run(&settings, instruments, &run_id, stop_rx, stdin, tokio::io::stdout())
        .await
        .context("Run failed")?;

    println!(
        "Stopped by user after {} samples ({} fields skipped)",
        summary.ticks, summary.skipped_fields
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let code = match run(Cli::parse()).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            1
        }
    };
    // The blocking stdin reader would otherwise hold the runtime open.
    std::process::exit(code);
}
