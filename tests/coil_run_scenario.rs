//! End-to-end runs against the simulated bench.

use coil_daq::app::execute_run;
use coil_daq::command::{CommandDispatcher, OperatorCommand};
use coil_daq::config::Settings;
use coil_daq::error::DaqError;
use coil_daq::instruments::Instruments;
use coil_daq::scheduler::AcquisitionScheduler;
use coil_daq::sink::{read_log, CsvLogSink, InfluxSink, RunHeader};
use coil_daq::supply::RampPhase;
use std::io::Cursor;
use std::time::Duration;
use tokio::sync::watch;

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.safety.current_ceiling = 550.0;
    settings.voltmeter.settle_ms = 1;
    settings.supply.opc_poll_interval_ms = 1;
    settings.acquisition.period_ms = 20;
    settings.acquisition.pacing_ms = 1;
    settings
}

fn scheduler_for(settings: &Settings, instruments: &Instruments) -> AcquisitionScheduler {
    AcquisitionScheduler::new(
        instruments.voltmeter.clone(),
        instruments.digitizer.clone(),
        instruments.supply.clone(),
        settings.acquisition.period(),
        settings.acquisition.pacing(),
    )
}

#[tokio::test]
async fn test_ceiling_ramp_and_interleaved_shutdown() {
    let settings = fast_settings();
    let (instruments, bench) = Instruments::simulated(&settings);
    let dispatcher = CommandDispatcher::new(instruments.supply.clone());
    instruments.supply.initialize(0.4).await.unwrap();
    bench.supply.clear_calls();

    // above the ceiling: rejected, device untouched
    let err = dispatcher
        .dispatch(OperatorCommand::SetCurrent(600.0))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::SafetyLimitExceeded { .. }));
    assert!(bench.supply.calls().is_empty());

    // ramp from setpoint 0
    let plan = instruments.supply.plan_ramp(100.0, 10.0).await.unwrap();
    assert_eq!(plan.start, 0.0);
    assert_eq!(plan.duration, 10.0);
    assert!(instruments.supply.is_armed());
    instruments.supply.trigger().await.unwrap();
    assert_eq!(instruments.supply.phase(), RampPhase::Ramping);

    // shutdown from the command path while a tick is in flight
    let mut scheduler = scheduler_for(&settings, &instruments);
    let shutdown = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.dispatch(OperatorCommand::Shutdown).await })
    };
    scheduler.tick().await;
    shutdown.await.unwrap().unwrap();

    let next = scheduler.tick().await;
    assert_eq!(next.psu_iout_a, Some(0.0));
    let state = instruments.supply.status().await.unwrap();
    assert!(!state.output_enabled);
    assert_eq!(state.current_setpoint, 0.0);
    assert_eq!(state.phase, RampPhase::Shutdown);

    // a later plan is unaffected by the shutdown
    let plan = instruments.supply.plan_ramp(100.0, 10.0).await.unwrap();
    assert_eq!(plan.duration, 10.0);
    assert!(instruments.supply.is_armed());

    assert_eq!(bench.supply.overlaps(), 0);
    instruments.close().await.unwrap();
}

#[tokio::test]
async fn test_full_run_logs_every_tick_and_closes_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = fast_settings();
    settings.application.output_dir = dir.path().to_path_buf();
    settings.acquisition.shutdown_supply_on_exit = true;

    let (instruments, bench) = Instruments::simulated(&settings);
    let (stop_tx, stop_rx) = watch::channel(false);
    let input = Cursor::new(b"planRamp 1 100\ntrigger\nexit\n".to_vec());

    let run = {
        let settings = settings.clone();
        tokio::spawn(async move {
            execute_run(&settings, instruments, "coil_07", stop_rx, input, tokio::io::sink()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    stop_tx.send(true).unwrap();
    let summary = run.await.unwrap().unwrap();

    let records = read_log(dir.path().join("coil_07.csv")).unwrap();
    assert!(summary.ticks > 0);
    assert_eq!(records.len() as u64, summary.ticks);
    assert!(records.iter().all(|r| r.channel1_v.is_some()));

    assert_eq!(bench.supply.with_model(|m| m.ramps_started), 1);
    // shut down on exit
    assert!(!bench.supply.with_model(|m| m.output_enabled));
    for closes in [
        bench.voltmeter.close_count(),
        bench.supply.close_count(),
        bench.digitizer.close_count(),
    ] {
        assert_eq!(closes, 1);
    }
    assert_eq!(bench.supply.overlaps(), 0);
}

#[tokio::test]
async fn test_failed_bring_up_still_closes_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = fast_settings();
    settings.application.output_dir = dir.path().to_path_buf();
    settings.supply.opc_timeout_ms = 10;

    let (instruments, bench) = Instruments::simulated(&settings);
    bench.supply.with_model(|m| m.opc_stalled = true);
    let (_stop_tx, stop_rx) = watch::channel(false);

    let err = execute_run(
        &settings,
        instruments,
        "coil_08",
        stop_rx,
        Cursor::new(Vec::new()),
        tokio::io::sink(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, DaqError::TransportTimeout { .. }));
    assert_eq!(bench.supply.close_count(), 1);
    assert_eq!(bench.voltmeter.close_count(), 1);
    assert!(!dir.path().join("coil_08.csv").exists());
}

#[cfg(feature = "sink_influx")]
fn influx_scheduler(
    settings: &Settings,
    instruments: &Instruments,
    url: String,
    path: &std::path::Path,
) -> AcquisitionScheduler {
    let header = RunHeader {
        voltmeter: "sim voltmeter".to_string(),
        supply: "sim supply".to_string(),
        digitizer: "sim digitizer".to_string(),
        start: chrono::Utc::now(),
    };
    let mut influx = settings.influx.clone();
    influx.enabled = true;
    influx.url = url;
    influx.org = "lab".to_string();
    influx.bucket_name = "coils".to_string();
    influx.timeout_ms = 2000;

    scheduler_for(settings, instruments)
        .with_sink(Box::new(InfluxSink::new(&influx).unwrap()))
        .with_sink(Box::new(CsvLogSink::create(path, &header).unwrap()))
}

#[cfg(feature = "sink_influx")]
#[tokio::test]
async fn test_unreachable_influx_does_not_stop_csv_log() {
    let dir = tempfile::tempdir().unwrap();
    let settings = fast_settings();
    let (instruments, _bench) = Instruments::simulated(&settings);
    let path = dir.path().join("isolation.csv");

    let mut scheduler =
        influx_scheduler(&settings, &instruments, "http://127.0.0.1:9".to_string(), &path);
    for _ in 0..3 {
        scheduler.tick().await;
    }
    // refused points surface on a later write
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.tick().await;

    assert!(scheduler.summary().sink_failures.get("influx").copied().unwrap_or(0) >= 1);
    assert_eq!(scheduler.summary().sink_failures.get("csv"), None);
    assert_eq!(read_log(&path).unwrap().len(), 4);
    instruments.close().await.unwrap();
}

#[cfg(feature = "sink_influx")]
#[tokio::test]
async fn test_silent_influx_server_does_not_slow_ticks() {
    use tokio::net::TcpListener;

    // accepts connections and never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let settings = fast_settings();
    let (instruments, _bench) = Instruments::simulated(&settings);
    let path = dir.path().join("stalled.csv");

    let mut scheduler = influx_scheduler(&settings, &instruments, url, &path);
    let started = std::time::Instant::now();
    for _ in 0..3 {
        scheduler.tick().await;
    }
    let elapsed = started.elapsed();

    // one influx request timeout is 2 s; three ticks must finish well inside it
    assert!(elapsed < Duration::from_millis(1500), "3 ticks took {elapsed:?}");
    assert_eq!(read_log(&path).unwrap().len(), 3);
    assert_eq!(scheduler.summary().sink_failures.get("csv"), None);
    instruments.close().await.unwrap();
}
