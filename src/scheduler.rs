//! Fixed-period acquisition loop.
//!
//! Each tick takes one timestamp, then reads in order:
//! 1. voltmeter channel
//! 2. every digitizer channel (one query)
//! 3. supply measured current, a pacing pause, then the supply voltage setpoint
//! 4. the thermometer pair, when one is configured
//!
//! A failed read leaves its field empty and the tick continues. The record is
//! then written to every sink in registration order; a sink failure is logged
//! and counted and the remaining sinks are still written.

use crate::digitizer::{Digitizer, Thermometer};
use crate::error::AppResult;
use crate::protocol::Voltmeter;
use crate::record::SampleRecord;
use crate::sink::RecordSink;
use crate::supply::Supply;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Totals reported when the loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    /// Fields left empty across all ticks
    pub skipped_fields: u64,
    /// Failed writes per sink name
    pub sink_failures: BTreeMap<String, u64>,
}

pub struct AcquisitionScheduler {
    voltmeter: Voltmeter,
    digitizer: Digitizer,
    supply: Supply,
    thermometer: Option<Thermometer>,
    sinks: Vec<Box<dyn RecordSink>>,
    period: Duration,
    pacing: Duration,
    voltmeter_channel: u8,
    vmeas_scale: f64,
    summary: RunSummary,
}

fn keep<T>(field: &'static str, result: AppResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(field, error = %e, "Skipping field this tick");
            None
        }
    }
}

impl AcquisitionScheduler {
    pub fn new(
        voltmeter: Voltmeter,
        digitizer: Digitizer,
        supply: Supply,
        period: Duration,
        pacing: Duration,
    ) -> Self {
        Self {
            voltmeter,
            digitizer,
            supply,
            thermometer: None,
            sinks: Vec::new(),
            period,
            pacing,
            voltmeter_channel: 1,
            vmeas_scale: 1.0,
            summary: RunSummary::default(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn RecordSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_thermometer(mut self, thermometer: Option<Thermometer>) -> Self {
        self.thermometer = thermometer;
        self
    }

    pub fn with_voltmeter_channel(mut self, channel: u8) -> Self {
        self.voltmeter_channel = channel;
        self
    }

    /// Scale from digitizer channel 1 to the supply's sensed output voltage.
    pub fn with_vmeas_scale(mut self, scale: f64) -> Self {
        self.vmeas_scale = scale;
        self
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Read every instrument once.
    pub async fn acquire(&self) -> SampleRecord {
        let mut record = SampleRecord::empty(Utc::now());

        record.channel1_v = keep(
            "Channel1_V",
            self.voltmeter.read_channel(self.voltmeter_channel).await,
        );

        if let Some(values) = keep("Digitizer", self.digitizer.read_channels().await) {
            record.digitizer_ch0 = values.first().copied();
            record.digitizer_ch1 = values.get(1).copied();
            record.psu_vout_meas = record.digitizer_ch1.map(|v| v * self.vmeas_scale);
        }

        record.psu_iout_a = keep("PSU_Iout_A", self.supply.measured_current().await);
        tokio::time::sleep(self.pacing).await;
        record.psu_vout_v = keep("PSU_Vout_V", self.supply.voltage_setpoint().await);

        match &self.thermometer {
            Some(thermometer) => {
                if let Some((t0, t180)) = keep("Temp", thermometer.read_pair().await) {
                    record.temp_0 = Some(t0);
                    record.temp_180 = Some(t180);
                }
            }
            None => {
                record.temp_0 = Some(0.0);
                record.temp_180 = Some(0.0);
            }
        }

        record
    }

    /// Write `record` to every sink. Returns the number of sinks that failed.
    pub async fn publish(&mut self, record: &SampleRecord) -> usize {
        let mut failed = 0;
        for sink in &mut self.sinks {
            if let Err(e) = sink.write(record).await {
                warn!(sink = sink.name(), error = %e, "Sink write failed");
                *self
                    .summary
                    .sink_failures
                    .entry(sink.name().to_string())
                    .or_insert(0) += 1;
                failed += 1;
            }
        }
        failed
    }

    /// One full tick: acquire, then publish.
    pub async fn tick(&mut self) -> SampleRecord {
        let record = self.acquire().await;
        self.publish(&record).await;

        self.summary.ticks += 1;
        self.summary.skipped_fields += record.missing_fields() as u64;
        debug!(tick = self.summary.ticks, "Tick complete");
        record
    }

    /// Tick every period until `stop` turns true or its sender is dropped,
    /// then close the sinks.
    ///
    /// A tick that overruns the period delays the next one rather than
    /// bunching ticks together.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> RunSummary {
        info!(period_ms = self.period.as_millis() as u64, sinks = self.sinks.len(), "Acquisition started");
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        for sink in &mut self.sinks {
            if let Err(e) = sink.close().await {
                warn!(sink = sink.name(), error = %e, "Sink close failed");
            }
        }

        info!(
            ticks = self.summary.ticks,
            skipped_fields = self.summary.skipped_fields,
            "Acquisition stopped"
        );
        self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::error::DaqError;
    use crate::instruments::Instruments;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MemorySink {
        records: Arc<Mutex<Vec<SampleRecord>>>,
    }

    #[async_trait]
    impl RecordSink for MemorySink {
        fn name(&self) -> &str {
            "memory"
        }

        async fn write(&mut self, record: &SampleRecord) -> AppResult<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn close(&mut self) -> AppResult<()> {
            Ok(())
        }
    }

    struct DownSink;

    #[async_trait]
    impl RecordSink for DownSink {
        fn name(&self) -> &str {
            "down"
        }

        async fn write(&mut self, _record: &SampleRecord) -> AppResult<()> {
            Err(DaqError::SinkWriteFailure {
                sink: "down".to_string(),
                reason: "connection refused".to_string(),
            })
        }

        async fn close(&mut self) -> AppResult<()> {
            Ok(())
        }
    }

    fn scheduler(instruments: &Instruments) -> AcquisitionScheduler {
        AcquisitionScheduler::new(
            instruments.voltmeter.clone(),
            instruments.digitizer.clone(),
            instruments.supply.clone(),
            Duration::from_millis(5),
            Duration::from_millis(1),
        )
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.voltmeter.settle_ms = 1;
        settings.supply.opc_poll_interval_ms = 1;
        settings
    }

    #[tokio::test]
    async fn test_acquire_merges_all_instruments() {
        let (instruments, bench) = Instruments::simulated(&settings());
        bench.voltmeter.with_model(|m| m.readings = [2.0e-6, 0.0]);
        instruments.supply.set_voltage(3.0).await.unwrap();

        let record = scheduler(&instruments).with_vmeas_scale(10.0).acquire().await;

        assert_eq!(record.channel1_v, Some(2.0e-6));
        assert_eq!(record.digitizer_ch0, Some(0.05));
        assert_eq!(record.digitizer_ch1, Some(0.4));
        assert_eq!(record.psu_vout_meas, Some(4.0));
        assert_eq!(record.psu_iout_a, Some(0.0));
        assert_eq!(record.psu_vout_v, Some(3.0));
        assert_eq!((record.temp_0, record.temp_180), (Some(0.0), Some(0.0)));
    }

    #[tokio::test]
    async fn test_failed_read_skips_only_that_field() {
        let (instruments, bench) = Instruments::simulated(&settings());
        bench.voltmeter.with_model(|m| m.garbage = true);
        let memory = MemorySink::default();

        let mut sched = scheduler(&instruments).with_sink(Box::new(memory.clone()));
        let record = sched.tick().await;

        assert!(record.channel1_v.is_none());
        assert!(record.psu_iout_a.is_some());
        assert_eq!(memory.records.lock().unwrap().len(), 1);
        assert_eq!(sched.summary().skipped_fields, 1);
    }

    #[tokio::test]
    async fn test_supply_timeout_skips_only_supply_fields() {
        let (instruments, bench) = Instruments::simulated(&settings());
        bench.supply.set_timeout(Duration::from_millis(10));
        bench.supply.set_unresponsive(true);
        let memory = MemorySink::default();
        let mut sched = scheduler(&instruments).with_sink(Box::new(memory.clone()));

        let record = sched.tick().await;
        assert!(record.psu_iout_a.is_none());
        assert!(record.psu_vout_v.is_none());
        assert!(record.channel1_v.is_some());
        assert!(record.digitizer_ch0.is_some());
        assert!(record.digitizer_ch1.is_some());
        assert_eq!(sched.summary().skipped_fields, 2);

        bench.supply.set_unresponsive(false);
        let record = sched.tick().await;
        assert_eq!(record.missing_fields(), 0);
        assert_eq!(memory.records.lock().unwrap().len(), 2);
        assert_eq!(sched.summary().ticks, 2);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_block_other_sinks() {
        let (instruments, _bench) = Instruments::simulated(&settings());
        let memory = MemorySink::default();
        let (stop_tx, stop_rx) = watch::channel(false);

        let sched = scheduler(&instruments)
            .with_sink(Box::new(DownSink))
            .with_sink(Box::new(memory.clone()));
        let run = tokio::spawn(sched.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        let summary = run.await.unwrap();

        let written = memory.records.lock().unwrap().clone();
        assert!(summary.ticks >= 2);
        assert_eq!(written.len() as u64, summary.ticks);
        assert_eq!(summary.sink_failures.get("down"), Some(&summary.ticks));
        assert!(written.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (instruments, _bench) = Instruments::simulated(&settings());
        let (_stop_tx, stop_rx) = watch::channel(true);

        let summary = scheduler(&instruments).run(stop_rx).await;
        assert_eq!(summary.ticks, 0);
    }
}
