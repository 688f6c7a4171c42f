//! Run context owning every instrument session.
//!
//! Built once at startup and handed to the scheduler and the command channel.
//! [`Instruments::close`] closes each session exactly once; if the context is
//! dropped instead, each session closes its transport when its last handle goes.

use crate::config::Settings;
use crate::digitizer::{Digitizer, Thermometer};
use crate::error::{AppResult, DaqError, Device};
use crate::protocol::{OpcPolicy, Voltmeter};
use crate::session::{DeviceSession, LineOptions, LineTransport, SessionHandle, Transport};
use crate::sim::SimBench;
use crate::supply::{SafetyLimits, Supply};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Transports for one run, before sessions are spawned.
pub struct Transports {
    pub voltmeter: Box<dyn Transport>,
    pub supply: Box<dyn Transport>,
    pub digitizer: Box<dyn Transport>,
    pub thermometer: Option<Box<dyn Transport>>,
}

pub struct Instruments {
    pub voltmeter: Voltmeter,
    pub supply: Supply,
    pub digitizer: Digitizer,
    pub thermometer: Option<Thermometer>,
    sessions: Vec<SessionHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Instruments {
    /// Connect to the bench hardware.
    pub async fn open(settings: &Settings) -> AppResult<Self> {
        let vm = &settings.voltmeter;
        let voltmeter = open_voltmeter(
            settings,
            LineOptions::new(
                Duration::from_millis(vm.timeout_ms),
                &vm.read_terminator,
                &vm.write_terminator,
            ),
        )?;

        let ps = &settings.supply;
        let supply = LineTransport::connect_tcp(
            Device::Supply,
            &ps.address,
            LineOptions::new(
                Duration::from_millis(ps.timeout_ms),
                &ps.read_terminator,
                &ps.write_terminator,
            ),
        )
        .await?;

        let dg = &settings.digitizer;
        let digitizer = LineTransport::connect_tcp(
            Device::Digitizer,
            &dg.address,
            LineOptions::new(
                Duration::from_millis(dg.timeout_ms),
                &dg.read_terminator,
                &dg.write_terminator,
            ),
        )
        .await?;

        let th = &settings.thermometer;
        let thermometer: Option<Box<dyn Transport>> = if th.enabled {
            Some(Box::new(
                LineTransport::connect_tcp(
                    Device::Thermometer,
                    &th.address,
                    LineOptions::new(Duration::from_millis(th.timeout_ms), "\r\n", "\r\n"),
                )
                .await?,
            ))
        } else {
            None
        };

        Ok(Self::from_transports(
            settings,
            Transports {
                voltmeter,
                supply: Box::new(supply),
                digitizer: Box::new(digitizer),
                thermometer,
            },
        ))
    }

    /// Run against simulated instruments. The returned bench shares state with
    /// the sessions.
    pub fn simulated(settings: &Settings) -> (Self, SimBench) {
        let bench = SimBench::new();
        let thermometer: Option<Box<dyn Transport>> = if settings.thermometer.enabled {
            Some(Box::new(bench.thermometer.clone()))
        } else {
            None
        };
        let instruments = Self::from_transports(
            settings,
            Transports {
                voltmeter: Box::new(bench.voltmeter.clone()),
                supply: Box::new(bench.supply.clone()),
                digitizer: Box::new(bench.digitizer.clone()),
                thermometer,
            },
        );
        (instruments, bench)
    }

    /// Spawn one session per transport and build the instrument wrappers.
    pub fn from_transports(settings: &Settings, transports: Transports) -> Self {
        let mut sessions = Vec::new();
        let mut tasks = Vec::new();
        let mut spawn = |device: Device, transport: Box<dyn Transport>| {
            let (handle, task) = DeviceSession::spawn(device, transport);
            sessions.push(handle.clone());
            tasks.push(task);
            handle
        };

        let voltmeter = Voltmeter::new(
            spawn(Device::Voltmeter, transports.voltmeter),
            Duration::from_millis(settings.voltmeter.settle_ms),
        );
        let supply = Supply::new(
            spawn(Device::Supply, transports.supply),
            OpcPolicy::new(
                Duration::from_millis(settings.supply.opc_poll_interval_ms),
                Duration::from_millis(settings.supply.opc_timeout_ms),
            ),
            SafetyLimits::from(&settings.safety),
        );
        let digitizer = Digitizer::new(
            spawn(Device::Digitizer, transports.digitizer),
            settings.digitizer.read_command.clone(),
            settings.digitizer.channels,
        );
        let thermometer = transports.thermometer.map(|transport| {
            Thermometer::new(
                spawn(Device::Thermometer, transport),
                settings.thermometer.inputs.clone(),
            )
        });

        info!(sessions = sessions.len(), "Instrument sessions open");
        Self {
            voltmeter,
            supply,
            digitizer,
            thermometer,
            sessions,
            tasks,
        }
    }

    /// Close every session once and wait for the owner tasks to finish.
    pub async fn close(self) -> AppResult<()> {
        let mut errors = Vec::new();
        for session in &self.sessions {
            if let Err(e) = session.close().await {
                warn!(device = %session.device(), error = %e, "Session close failed");
                errors.push(e);
            }
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                errors.push(DaqError::Configuration(format!("session task failed: {}", e)));
            }
        }

        if errors.is_empty() {
            info!("All instrument sessions closed");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

#[cfg(feature = "instrument_serial")]
fn open_voltmeter(settings: &Settings, options: LineOptions) -> AppResult<Box<dyn Transport>> {
    Ok(Box::new(LineTransport::open_serial(
        Device::Voltmeter,
        &settings.voltmeter,
        options,
    )?))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_voltmeter(_settings: &Settings, _options: LineOptions) -> AppResult<Box<dyn Transport>> {
    Err(DaqError::Configuration(
        "voltmeter serial link requires the instrument_serial feature".to_string(),
    ))
}
