//! Simulated instruments
//!
//! Each simulated instrument is a [`SimPort`] wrapping a model that answers the
//! same SCPI dialect as the bench hardware. Ports provide:
//! - Call logging for test verification
//! - Simulated latency
//! - Overlap detection (a second command sent while a response is still pending)
//! - Fault injection (instrument errors, unresponsive device, bad readback)
//!
//! `SimPort` is `Clone`; clones share state, so a test can keep one clone while
//! the session owns another.

use crate::error::{AppResult, DaqError, Device};
use crate::session::Transport;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Behaviour of one simulated instrument.
pub trait SimModel: Send + 'static {
    /// Apply one command line. Returns the response for queries.
    fn handle(&mut self, command: &str) -> Option<String>;
}

struct PortState<M> {
    model: M,
    calls: Vec<String>,
    pending: VecDeque<String>,
    overlaps: usize,
    closes: usize,
    closed: bool,
    latency: Duration,
    unresponsive: bool,
    timeout: Duration,
}

/// [`Transport`] backed by an in-process instrument model.
pub struct SimPort<M> {
    device: Device,
    state: Arc<Mutex<PortState<M>>>,
}

impl<M> Clone for SimPort<M> {
    fn clone(&self) -> Self {
        Self {
            device: self.device,
            state: Arc::clone(&self.state),
        }
    }
}

impl<M: SimModel> SimPort<M> {
    pub fn new(device: Device, model: M) -> Self {
        Self {
            device,
            state: Arc::new(Mutex::new(PortState {
                model,
                calls: Vec::new(),
                pending: VecDeque::new(),
                overlaps: 0,
                closes: 0,
                closed: false,
                latency: Duration::ZERO,
                unresponsive: false,
                timeout: Duration::from_millis(50),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PortState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every command line received, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Commands that arrived while an earlier response was still unread.
    pub fn overlaps(&self) -> usize {
        self.lock().overlaps
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    /// Delay applied to every send and receive.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Stop answering; receives time out after the port timeout.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.lock().unresponsive = unresponsive;
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.lock().timeout = timeout;
    }

    /// Inspect or modify the model.
    pub fn with_model<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        f(&mut self.lock().model)
    }
}

#[async_trait]
impl<M: SimModel> Transport for SimPort<M> {
    async fn send(&mut self, line: &str) -> AppResult<()> {
        let latency = {
            let mut st = self.lock();
            if st.closed {
                return Err(DaqError::Transport {
                    device: self.device,
                    reason: "port closed".to_string(),
                });
            }
            st.calls.push(line.to_string());
            if !st.pending.is_empty() {
                st.overlaps += 1;
            }
            if let Some(reply) = st.model.handle(line) {
                st.pending.push_back(reply);
            }
            st.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    async fn recv(&mut self) -> AppResult<String> {
        let (latency, unresponsive, timeout) = {
            let st = self.lock();
            (st.latency, st.unresponsive, st.timeout)
        };
        if unresponsive {
            tokio::time::sleep(timeout).await;
        } else if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut st = self.lock();
        let reply = if unresponsive { None } else { st.pending.pop_front() };
        reply.ok_or_else(|| {
            st.pending.clear();
            DaqError::TransportTimeout {
                device: self.device,
                operation: st.calls.last().cloned().unwrap_or_default(),
            }
        })
    }

    async fn close(&mut self) -> AppResult<()> {
        let mut st = self.lock();
        st.closes += 1;
        st.closed = true;
        Ok(())
    }
}

fn split_command(command: &str) -> (String, Option<&str>) {
    match command.trim().split_once(' ') {
        Some((header, arg)) => (header.to_ascii_uppercase(), Some(arg.trim())),
        None => (command.trim().to_ascii_uppercase(), None),
    }
}

const NO_ERROR: &str = "0,\"No error\"";

// =============================================================================
// Voltmeter
// =============================================================================

/// Nanovoltmeter answering `:READ?` with a fixed reading per channel.
#[derive(Debug, Clone)]
pub struct VoltmeterModel {
    pub readings: [f64; 2],
    pub channel: u8,
    /// Respond to `:READ?` with a non-numeric string
    pub garbage: bool,
}

impl VoltmeterModel {
    pub fn new(reading: f64) -> Self {
        Self {
            readings: [reading, reading],
            channel: 1,
            garbage: false,
        }
    }
}

impl SimModel for VoltmeterModel {
    fn handle(&mut self, command: &str) -> Option<String> {
        let (header, arg) = split_command(command);
        match header.as_str() {
            "*IDN?" => Some("KEITHLEY INSTRUMENTS INC.,MODEL 2182A,0000000,C02 /A02".to_string()),
            "SYST:ERR?" => Some(NO_ERROR.to_string()),
            ":SENS:CHAN" => {
                if let Some(channel) = arg.and_then(|a| a.parse().ok()) {
                    self.channel = channel;
                }
                None
            }
            ":READ?" => {
                if self.garbage {
                    Some("OVFL".to_string())
                } else {
                    let idx = usize::from(self.channel.saturating_sub(1)).min(1);
                    Some(format!("{:E}", self.readings[idx]))
                }
            }
            h if h.ends_with('?') => Some("0".to_string()),
            _ => None,
        }
    }
}

// =============================================================================
// Supply
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct ActiveRamp {
    from: f64,
    to: f64,
    started: Instant,
    duration: f64,
}

/// Programmable supply with waveform ramp, OPC and an error queue.
#[derive(Debug, Clone)]
pub struct SupplyModel {
    pub voltage_setpoint: f64,
    pub protection_level: f64,
    pub current_setpoint: f64,
    pub output_enabled: bool,
    pub wave_mode: bool,
    pub wave_current: f64,
    pub wave_time: f64,
    pub initiated: bool,
    /// Offset added to `WAVE:CURR?` replies
    pub current_readback_skew: f64,
    /// Offset added to `WAVE:TIME?` replies
    pub time_readback_skew: f64,
    /// Answer `*OPC?` with `0` forever
    pub opc_stalled: bool,
    /// Load resistance used for `MEAS:VOLT?`
    pub load_ohms: f64,
    pub ramps_started: usize,
    errors: VecDeque<(i32, String)>,
    fail_next: Option<(i32, String)>,
    ramp: Option<ActiveRamp>,
}

impl Default for SupplyModel {
    fn default() -> Self {
        Self {
            voltage_setpoint: 0.0,
            protection_level: 66.0,
            current_setpoint: 0.0,
            output_enabled: false,
            wave_mode: false,
            wave_current: 0.0,
            wave_time: 0.0,
            initiated: false,
            current_readback_skew: 0.0,
            time_readback_skew: 0.0,
            opc_stalled: false,
            load_ohms: 0.001,
            ramps_started: 0,
            errors: VecDeque::new(),
            fail_next: None,
            ramp: None,
        }
    }
}

impl SupplyModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an instrument error on the next command.
    pub fn fail_next(&mut self, code: i32, message: &str) {
        self.fail_next = Some((code, message.to_string()));
    }

    /// Output current right now, following any running ramp.
    pub fn present_current(&mut self) -> f64 {
        if let Some(ramp) = self.ramp {
            let elapsed = ramp.started.elapsed().as_secs_f64();
            if ramp.duration <= 0.0 || elapsed >= ramp.duration {
                self.current_setpoint = ramp.to;
                self.ramp = None;
            } else {
                return ramp.from + (ramp.to - ramp.from) * elapsed / ramp.duration;
            }
        }
        self.current_setpoint
    }

    fn push_error(&mut self, code: i32, message: &str) {
        self.errors.push_back((code, message.to_string()));
    }

    fn number(&mut self, arg: Option<&str>) -> Option<f64> {
        let value = arg.and_then(|a| a.parse::<f64>().ok());
        if value.is_none() {
            self.push_error(-104, "Data type error");
        }
        value
    }
}

impl SimModel for SupplyModel {
    fn handle(&mut self, command: &str) -> Option<String> {
        if let Some((code, message)) = self.fail_next.take() {
            self.push_error(code, &message);
        }

        let (header, arg) = split_command(command);
        match header.as_str() {
            "*IDN?" => Some("TDK-LAMBDA,GEN30-560,SIM0001,2.0".to_string()),
            "*OPC?" => Some(if self.opc_stalled { "0" } else { "1" }.to_string()),
            "*CLS" => {
                self.errors.clear();
                None
            }
            "*RST" => {
                let errors = std::mem::take(&mut self.errors);
                *self = SupplyModel {
                    current_readback_skew: self.current_readback_skew,
                    time_readback_skew: self.time_readback_skew,
                    opc_stalled: self.opc_stalled,
                    load_ohms: self.load_ohms,
                    ramps_started: self.ramps_started,
                    errors,
                    ..SupplyModel::default()
                };
                None
            }
            "SYST:ERR?" => Some(match self.errors.pop_front() {
                Some((code, message)) => format!("{},\"{}\"", code, message),
                None => NO_ERROR.to_string(),
            }),
            "SOUR:VOLT:PROT:LEV" => {
                if let Some(v) = self.number(arg) {
                    self.protection_level = v;
                }
                None
            }
            "SOUR:VOLT:PROT:LEV?" => Some(self.protection_level.to_string()),
            "SOUR:VOLT" => {
                if let Some(v) = self.number(arg) {
                    if v > self.protection_level {
                        self.push_error(-222, "Data out of range");
                    } else {
                        self.voltage_setpoint = v;
                    }
                }
                None
            }
            "SOUR:VOLT?" => Some(self.voltage_setpoint.to_string()),
            "SOUR:CURR" => {
                if let Some(c) = self.number(arg) {
                    self.ramp = None;
                    self.current_setpoint = c;
                }
                None
            }
            "SOUR:CURR?" => {
                self.present_current();
                Some(self.current_setpoint.to_string())
            }
            "SOUR:CURR:MODE" => {
                match arg.map(str::to_ascii_uppercase).as_deref() {
                    Some("WAVE") => self.wave_mode = true,
                    Some("FIX") | Some("NONE") => self.wave_mode = false,
                    _ => self.push_error(-224, "Illegal parameter value"),
                }
                None
            }
            "SOUR:CURR:MODE?" => Some(if self.wave_mode { "WAVE" } else { "FIX" }.to_string()),
            "WAVE:CURR" => {
                if let Some(c) = self.number(arg) {
                    self.wave_current = c;
                }
                None
            }
            "WAVE:CURR?" => Some((self.wave_current + self.current_readback_skew).to_string()),
            "WAVE:TIME" => {
                if let Some(t) = self.number(arg) {
                    self.wave_time = t;
                }
                None
            }
            "WAVE:TIME?" => Some((self.wave_time + self.time_readback_skew).to_string()),
            "INIT" => {
                if self.wave_mode {
                    self.initiated = true;
                } else {
                    self.push_error(-221, "Settings conflict");
                }
                None
            }
            "*TRG" => {
                if self.initiated {
                    let from = self.present_current();
                    self.ramp = Some(ActiveRamp {
                        from,
                        to: self.wave_current,
                        started: Instant::now(),
                        duration: self.wave_time,
                    });
                    self.initiated = false;
                    self.ramps_started += 1;
                } else {
                    self.push_error(-211, "Trigger ignored");
                }
                None
            }
            "OUTP:STAT" => {
                match arg.map(str::to_ascii_uppercase).as_deref() {
                    Some("ON") | Some("1") => self.output_enabled = true,
                    Some("OFF") | Some("0") => self.output_enabled = false,
                    _ => self.push_error(-224, "Illegal parameter value"),
                }
                None
            }
            "OUTP:STAT?" => Some(if self.output_enabled { "1" } else { "0" }.to_string()),
            "MEAS:CURR?" => {
                let current = if self.output_enabled {
                    self.present_current()
                } else {
                    0.0
                };
                Some(current.to_string())
            }
            "MEAS:VOLT?" => {
                let volts = if self.output_enabled {
                    (self.present_current() * self.load_ohms).min(self.voltage_setpoint)
                } else {
                    0.0
                };
                Some(volts.to_string())
            }
            _ => {
                self.push_error(-113, "Undefined header");
                None
            }
        }
    }
}

// =============================================================================
// Digitizer / thermometer
// =============================================================================

/// Digitizer returning one comma-separated value per channel.
#[derive(Debug, Clone)]
pub struct DigitizerModel {
    pub values: Vec<f64>,
}

impl DigitizerModel {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }
}

impl SimModel for DigitizerModel {
    fn handle(&mut self, command: &str) -> Option<String> {
        let (header, _) = split_command(command);
        match header.as_str() {
            "*IDN?" => Some("SIM,ANALOG-DIGITIZER,0,1.0".to_string()),
            h if h.starts_with("READ?") || h.starts_with("MEAS") => Some(
                self.values
                    .iter()
                    .map(f64::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            h if h.ends_with('?') => Some("0".to_string()),
            _ => None,
        }
    }
}

/// Temperature monitor answering `KRDG? <input>` in Kelvin.
#[derive(Debug, Clone)]
pub struct ThermometerModel {
    pub kelvin: [f64; 2],
}

impl SimModel for ThermometerModel {
    fn handle(&mut self, command: &str) -> Option<String> {
        let (header, arg) = split_command(command);
        match header.as_str() {
            "*IDN?" => Some("LSCI,MODEL224,SIM,1.0".to_string()),
            "KRDG?" => Some(match arg.map(str::to_ascii_uppercase).as_deref() {
                Some("B") => self.kelvin[1].to_string(),
                _ => self.kelvin[0].to_string(),
            }),
            _ => None,
        }
    }
}

// =============================================================================
// Bench
// =============================================================================

/// One simulated port per instrument, as wired on the bench.
#[derive(Clone)]
pub struct SimBench {
    pub voltmeter: SimPort<VoltmeterModel>,
    pub supply: SimPort<SupplyModel>,
    pub digitizer: SimPort<DigitizerModel>,
    pub thermometer: SimPort<ThermometerModel>,
}

impl SimBench {
    pub fn new() -> Self {
        Self {
            voltmeter: SimPort::new(Device::Voltmeter, VoltmeterModel::new(1.0e-6)),
            supply: SimPort::new(Device::Supply, SupplyModel::new()),
            digitizer: SimPort::new(Device::Digitizer, DigitizerModel::new(vec![0.05, 0.4])),
            thermometer: SimPort::new(
                Device::Thermometer,
                ThermometerModel {
                    kelvin: [4.2, 4.3],
                },
            ),
        }
    }
}

impl Default for SimBench {
    fn default() -> Self {
        Self::new()
    }
}
