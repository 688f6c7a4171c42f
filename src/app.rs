//! Run orchestration: bring the bench up, log until stopped, tear it down.

use crate::command::{CommandChannel, CommandDispatcher};
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::instruments::Instruments;
use crate::scheduler::{AcquisitionScheduler, RunSummary};
use crate::sink::{CsvLogSink, InfluxSink, RunHeader};
use chrono::Utc;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Reject identifiers that would escape the output directory.
pub fn validate_run_id(run_id: &str) -> AppResult<&str> {
    let run_id = run_id.trim();
    if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id == ".." {
        return Err(DaqError::InvalidArgument(format!(
            "run id '{}' must be a plain file name",
            run_id
        )));
    }
    Ok(run_id)
}

/// `<output_dir>/<run_id>.csv`
pub fn log_path(settings: &Settings, run_id: &str) -> PathBuf {
    settings
        .application
        .output_dir
        .join(format!("{}.csv", run_id))
}

/// Health checks and initial configuration of every instrument.
pub async fn bring_up(settings: &Settings, instruments: &Instruments) -> AppResult<RunHeader> {
    let voltmeter = instruments.voltmeter.identify().await?;
    info!(idn = %voltmeter.trim(), "Voltmeter connected");
    instruments.voltmeter.configure(&settings.voltmeter).await?;

    let supply = instruments.supply.identify().await?;
    info!(idn = %supply.trim(), "Supply connected");
    instruments
        .supply
        .initialize(settings.supply.initial_voltage)
        .await?;

    let digitizer = match instruments.digitizer.identify().await {
        Ok(idn) => idn,
        Err(e) => {
            warn!(error = %e, "Digitizer did not identify");
            "unknown".to_string()
        }
    };

    Ok(RunHeader {
        voltmeter,
        supply,
        digitizer,
        start: Utc::now(),
    })
}

async fn acquire<R, W>(
    settings: &Settings,
    instruments: &Instruments,
    run_id: &str,
    stop: watch::Receiver<bool>,
    input: R,
    output: W,
) -> AppResult<RunSummary>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let header = bring_up(settings, instruments).await?;

    let mut scheduler = AcquisitionScheduler::new(
        instruments.voltmeter.clone(),
        instruments.digitizer.clone(),
        instruments.supply.clone(),
        settings.acquisition.period(),
        settings.acquisition.pacing(),
    )
    .with_voltmeter_channel(settings.voltmeter.channel)
    .with_vmeas_scale(settings.digitizer.vmeas_scale)
    .with_thermometer(instruments.thermometer.clone())
    .with_sink(Box::new(CsvLogSink::create(
        log_path(settings, run_id),
        &header,
    )?));
    if settings.influx.enabled {
        scheduler = scheduler.with_sink(Box::new(InfluxSink::new(&settings.influx)?));
    }

    let channel = CommandChannel::new(
        input,
        output,
        CommandDispatcher::new(instruments.supply.clone()),
    );
    let commands = tokio::spawn(async move {
        if let Err(e) = channel.run().await {
            error!(error = %e, "Command channel failed");
        }
    });

    let summary = scheduler.run(stop).await;
    commands.abort();
    Ok(summary)
}

/// Run one test from bring-up to teardown.
///
/// Sessions are closed on every path, including a failed bring-up.
pub async fn execute_run<R, W>(
    settings: &Settings,
    instruments: Instruments,
    run_id: &str,
    stop: watch::Receiver<bool>,
    input: R,
    output: W,
) -> AppResult<RunSummary>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let outcome = acquire(settings, &instruments, run_id, stop, input, output).await;
    if let Err(e) = &outcome {
        error!(error = %e, "Run aborted");
    }

    if settings.acquisition.shutdown_supply_on_exit {
        if let Err(e) = instruments.supply.shutdown().await {
            warn!(error = %e, "Supply shutdown on exit failed");
        }
    }

    let closed = instruments.close().await;
    let summary = outcome?;
    closed?;

    info!(
        ticks = summary.ticks,
        skipped_fields = summary.skipped_fields,
        sink_failures = ?summary.sink_failures,
        "Run complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_validation() {
        assert_eq!(validate_run_id(" coil_07 ").unwrap(), "coil_07");
        assert!(validate_run_id("").is_err());
        assert!(validate_run_id("../etc/passwd").is_err());
        assert!(validate_run_id("..").is_err());
    }

    #[test]
    fn test_log_path_uses_output_dir() {
        let mut settings = Settings::default();
        settings.application.output_dir = PathBuf::from("/data/runs");
        assert_eq!(log_path(&settings, "coil_07"), PathBuf::from("/data/runs/coil_07.csv"));
    }
}
