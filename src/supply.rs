//! Power supply control and current ramping.
//!
//! [`Supply`] is the only path to the supply session. Every operation runs as
//! one session transaction, so a multi-step sequence such as arming a ramp can
//! never be split by a scheduler read or another operator command.
//!
//! Ramp lifecycle:
//!
//! ```text
//! Idle --plan_ramp--> Configuring --confirmed--> Armed --trigger--> Ramping --duration--> Idle
//!                          |
//!                          +--failed--> Idle
//!
//! any --shutdown--> Shutdown
//! ```
//!
//! The current ceiling is checked before anything is sent. A request at or
//! above it never reaches the device.

use crate::config::SafetyConfig;
use crate::error::{AppResult, DaqError, Device};
use crate::protocol::{parse_number, Exchange, OpcPolicy};
use crate::session::SessionHandle;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyLimits {
    /// Requests at or above this current are refused
    pub current_ceiling: f64,
    /// Added to the voltage setpoint to form the protection level
    pub protection_margin: f64,
}

impl SafetyLimits {
    pub fn new(current_ceiling: f64, protection_margin: f64) -> Self {
        Self {
            current_ceiling,
            protection_margin,
        }
    }
}

impl From<&SafetyConfig> for SafetyLimits {
    fn from(config: &SafetyConfig) -> Self {
        Self::new(config.current_ceiling, config.protection_margin)
    }
}

/// Timing of one ramp, computed from the setpoint read just before arming.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampPlan {
    pub start: f64,
    pub target: f64,
    /// Amps per second
    pub rate: f64,
    /// Seconds
    pub duration: f64,
}

impl RampPlan {
    pub fn compute(start: f64, target: f64, rate: f64) -> AppResult<Self> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(DaqError::InvalidArgument(format!(
                "ramp rate must be positive, got {}",
                rate
            )));
        }
        Ok(Self {
            start,
            target,
            rate,
            duration: (target - start).abs() / rate,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RampPhase {
    #[default]
    Idle,
    Configuring,
    Armed,
    Ramping,
    Shutdown,
}

#[derive(Debug, Default)]
struct RampTracker {
    phase: RampPhase,
    armed: Option<RampPlan>,
    ramp_ends: Option<Instant>,
}

impl RampTracker {
    fn phase(&mut self) -> RampPhase {
        if self.phase == RampPhase::Ramping && self.ramp_ends.is_some_and(|end| Instant::now() >= end) {
            self.set(RampPhase::Idle);
        }
        self.phase
    }

    fn set(&mut self, phase: RampPhase) {
        self.phase = phase;
        if phase != RampPhase::Armed {
            self.armed = None;
        }
        if phase != RampPhase::Ramping {
            self.ramp_ends = None;
        }
    }

    fn arm(&mut self, plan: RampPlan) {
        self.set(RampPhase::Armed);
        self.armed = Some(plan);
    }
}

/// Fresh readings of the supply; nothing here is cached.
#[derive(Debug, Clone, PartialEq)]
pub struct SupplyState {
    pub current_setpoint: f64,
    pub voltage_setpoint: f64,
    pub protection_level: f64,
    pub output_enabled: bool,
    pub armed: bool,
    pub phase: RampPhase,
}

fn parse_output_state(response: &str) -> AppResult<bool> {
    match response.trim().to_ascii_uppercase().as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        other => Ok(parse_number(Device::Supply, other)? != 0.0),
    }
}

/// Ramp controller and SCPI operations for the coil supply.
#[derive(Clone)]
pub struct Supply {
    session: SessionHandle,
    opc: OpcPolicy,
    limits: SafetyLimits,
    tracker: Arc<Mutex<RampTracker>>,
}

impl std::fmt::Debug for Supply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supply")
            .field("session", &self.session)
            .field("limits", &self.limits)
            .finish()
    }
}

impl Supply {
    pub fn new(session: SessionHandle, opc: OpcPolicy, limits: SafetyLimits) -> Self {
        Self {
            session,
            opc,
            limits,
            tracker: Arc::new(Mutex::new(RampTracker::default())),
        }
    }

    pub fn limits(&self) -> SafetyLimits {
        self.limits
    }

    fn tracker(&self) -> MutexGuard<'_, RampTracker> {
        lock_tracker(&self.tracker)
    }

    pub fn phase(&self) -> RampPhase {
        self.tracker().phase()
    }

    pub fn is_armed(&self) -> bool {
        self.phase() == RampPhase::Armed
    }

    fn check_current(&self, requested: f64) -> AppResult<()> {
        if !requested.is_finite() || requested < 0.0 {
            return Err(DaqError::InvalidArgument(format!(
                "current must be a non-negative number, got {}",
                requested
            )));
        }
        if requested >= self.limits.current_ceiling {
            warn!(
                requested,
                ceiling = self.limits.current_ceiling,
                "Refusing current at or above ceiling"
            );
            return Err(DaqError::SafetyLimitExceeded {
                quantity: "current",
                requested,
                ceiling: self.limits.current_ceiling,
            });
        }
        Ok(())
    }

    async fn execute(&self, command: String) -> AppResult<()> {
        let opc = self.opc;
        self.session
            .transaction(move |io| {
                Box::pin(async move {
                    let mut ex = Exchange::new(io, Device::Supply, Some(opc));
                    ex.execute(&command).await
                })
            })
            .await
    }

    async fn query_f64(&self, command: &'static str) -> AppResult<f64> {
        let opc = self.opc;
        self.session
            .transaction(move |io| {
                Box::pin(async move {
                    let mut ex = Exchange::new(io, Device::Supply, Some(opc));
                    ex.query_f64(command).await
                })
            })
            .await
    }

    pub async fn identify(&self) -> AppResult<String> {
        self.session.query("*IDN?").await
    }

    /// Clear and check the error queue, reset, then bring the output up at
    /// `initial_voltage` and zero current.
    pub async fn initialize(&self, initial_voltage: f64) -> AppResult<()> {
        let opc = self.opc;
        self.session
            .transaction(move |io| {
                Box::pin(async move {
                    let mut ex = Exchange::new(io, Device::Supply, Some(opc));
                    ex.raw_write("*CLS").await?;
                    ex.check_error().await?;
                    ex.execute("*RST").await
                })
            })
            .await?;
        self.tracker().set(RampPhase::Idle);

        self.set_voltage(initial_voltage).await?;
        self.set_current(0.0).await?;
        self.set_output(true).await?;
        info!(initial_voltage, "Supply initialised, output on");
        Ok(())
    }

    /// Raise the protection level to `volts + margin`, then set the voltage.
    pub async fn set_voltage(&self, volts: f64) -> AppResult<()> {
        if !volts.is_finite() || volts < 0.0 {
            return Err(DaqError::InvalidArgument(format!(
                "voltage must be a non-negative number, got {}",
                volts
            )));
        }
        let protection = volts + self.limits.protection_margin;
        let opc = self.opc;

        self.session
            .transaction(move |io| {
                Box::pin(async move {
                    let mut ex = Exchange::new(io, Device::Supply, Some(opc));
                    ex.execute(&format!("SOUR:VOLT:PROT:LEV {}", protection)).await?;
                    ex.execute(&format!("SOUR:VOLT {}", volts)).await
                })
            })
            .await?;

        info!(volts, protection, "Supply voltage set");
        Ok(())
    }

    pub async fn set_current(&self, amps: f64) -> AppResult<()> {
        self.check_current(amps)?;
        self.execute(format!("SOUR:CURR {}", amps)).await?;
        info!(amps, "Supply current set");
        Ok(())
    }

    pub async fn set_output(&self, on: bool) -> AppResult<()> {
        let state = if on { "ON" } else { "OFF" };
        self.execute(format!("OUTP:STAT {}", state)).await?;
        info!(output = state, "Supply output switched");
        Ok(())
    }

    /// Read the present setpoint, program the waveform generator and arm it.
    ///
    /// Mode, target and duration are each read back before the next step;
    /// any mismatch or instrument error leaves the ramp un-armed and `INIT`
    /// is never sent. Read-back compares for exact equality.
    pub async fn plan_ramp(&self, target: f64, rate: f64) -> AppResult<RampPlan> {
        self.check_current(target)?;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(DaqError::InvalidArgument(format!(
                "ramp rate must be positive, got {}",
                rate
            )));
        }

        let opc = self.opc;
        let tracker = Arc::clone(&self.tracker);
        let result = self
            .session
            .transaction(move |io| {
                Box::pin(async move {
                    lock_tracker(&tracker).set(RampPhase::Configuring);
                    let mut ex = Exchange::new(io, Device::Supply, Some(opc));
                    let armed = arm_ramp(&mut ex, target, rate).await;

                    let mut state = lock_tracker(&tracker);
                    match &armed {
                        Ok(plan) => state.arm(*plan),
                        Err(_) => state.set(RampPhase::Idle),
                    }
                    armed
                })
            })
            .await;

        match &result {
            Ok(plan) => info!(
                start = plan.start,
                target = plan.target,
                rate = plan.rate,
                duration_s = plan.duration,
                "Ramp armed"
            ),
            Err(e) => warn!(target, rate, error = %e, "Ramp not armed"),
        }
        result
    }

    /// Fire the armed ramp. Fails with `NotArmed` without touching the device
    /// unless a confirmed plan is waiting.
    pub async fn trigger(&self) -> AppResult<()> {
        let opc = self.opc;
        let tracker = Arc::clone(&self.tracker);
        let plan = self
            .session
            .transaction(move |io| {
                Box::pin(async move {
                    let plan = {
                        let mut state = lock_tracker(&tracker);
                        match (state.phase(), state.armed) {
                            (RampPhase::Armed, Some(plan)) => plan,
                            _ => return Err(DaqError::NotArmed),
                        }
                    };

                    let mut ex = Exchange::new(io, Device::Supply, Some(opc));
                    let fired = ex.execute("*TRG").await;

                    let mut state = lock_tracker(&tracker);
                    match fired {
                        Ok(()) => {
                            state.set(RampPhase::Ramping);
                            state.ramp_ends = Some(
                                Instant::now() + Duration::from_secs_f64(plan.duration.max(0.0)),
                            );
                            Ok(plan)
                        }
                        Err(e) => {
                            state.set(RampPhase::Idle);
                            Err(e)
                        }
                    }
                })
            })
            .await?;

        info!(target = plan.target, duration_s = plan.duration, "Ramp triggered");
        Ok(())
    }

    /// Zero the current and switch the output off. Clears any armed ramp.
    pub async fn shutdown(&self) -> AppResult<()> {
        let opc = self.opc;
        let tracker = Arc::clone(&self.tracker);
        self.session
            .transaction(move |io| {
                Box::pin(async move {
                    lock_tracker(&tracker).set(RampPhase::Idle);
                    let mut ex = Exchange::new(io, Device::Supply, Some(opc));
                    ex.execute("SOUR:CURR 0").await?;
                    ex.execute("OUTP:STAT OFF").await?;
                    lock_tracker(&tracker).set(RampPhase::Shutdown);
                    Ok(())
                })
            })
            .await?;

        info!("Supply shut down");
        Ok(())
    }

    pub async fn measured_current(&self) -> AppResult<f64> {
        self.query_f64("MEAS:CURR?").await
    }

    pub async fn measured_voltage(&self) -> AppResult<f64> {
        self.query_f64("MEAS:VOLT?").await
    }

    pub async fn voltage_setpoint(&self) -> AppResult<f64> {
        self.query_f64("SOUR:VOLT?").await
    }

    pub async fn current_setpoint(&self) -> AppResult<f64> {
        self.query_f64("SOUR:CURR?").await
    }

    pub async fn protection_level(&self) -> AppResult<f64> {
        self.query_f64("SOUR:VOLT:PROT:LEV?").await
    }

    pub async fn output_enabled(&self) -> AppResult<bool> {
        let opc = self.opc;
        let response = self
            .session
            .transaction(move |io| {
                Box::pin(async move {
                    let mut ex = Exchange::new(io, Device::Supply, Some(opc));
                    ex.query("OUTP:STAT?").await
                })
            })
            .await?;
        parse_output_state(&response)
    }

    /// Re-query every setpoint in one transaction.
    pub async fn status(&self) -> AppResult<SupplyState> {
        let opc = self.opc;
        let (current_setpoint, voltage_setpoint, protection_level, output) = self
            .session
            .transaction(move |io| {
                Box::pin(async move {
                    let mut ex = Exchange::new(io, Device::Supply, Some(opc));
                    let current = ex.query_f64("SOUR:CURR?").await?;
                    let voltage = ex.query_f64("SOUR:VOLT?").await?;
                    let protection = ex.query_f64("SOUR:VOLT:PROT:LEV?").await?;
                    let output = ex.query("OUTP:STAT?").await?;
                    Ok((current, voltage, protection, output))
                })
            })
            .await?;

        let phase = self.phase();
        Ok(SupplyState {
            current_setpoint,
            voltage_setpoint,
            protection_level,
            output_enabled: parse_output_state(&output)?,
            armed: phase == RampPhase::Armed,
            phase,
        })
    }
}

fn lock_tracker(tracker: &Mutex<RampTracker>) -> MutexGuard<'_, RampTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

fn mismatch(parameter: &'static str, written: impl ToString, read: impl ToString) -> DaqError {
    DaqError::ReadbackMismatch {
        device: Device::Supply,
        parameter,
        written: written.to_string(),
        read: read.to_string(),
    }
}

async fn arm_ramp(ex: &mut Exchange<'_>, target: f64, rate: f64) -> AppResult<RampPlan> {
    let start = ex.query_f64("SOUR:CURR?").await?;
    let plan = RampPlan::compute(start, target, rate)?;

    ex.execute("SOUR:CURR:MODE WAVE").await?;
    let mode = ex.query("SOUR:CURR:MODE?").await?;
    if mode.trim() != "WAVE" {
        return Err(mismatch("current mode", "WAVE", mode.trim()));
    }

    ex.execute(&format!("WAVE:CURR {}", plan.target)).await?;
    let read = ex.query_f64("WAVE:CURR?").await?;
    if read != plan.target {
        return Err(mismatch("wave current", plan.target, read));
    }

    ex.execute(&format!("WAVE:TIME {}", plan.duration)).await?;
    let read = ex.query_f64("WAVE:TIME?").await?;
    if read != plan.duration {
        return Err(mismatch("wave time", plan.duration, read));
    }

    ex.execute("INIT").await?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DeviceSession;
    use crate::sim::{SimPort, SupplyModel};
    use tracing_test::traced_test;

    fn supply() -> (SimPort<SupplyModel>, Supply) {
        let port = SimPort::new(Device::Supply, SupplyModel::new());
        let (handle, _task) = DeviceSession::spawn(Device::Supply, Box::new(port.clone()));
        let opc = OpcPolicy::new(Duration::from_millis(1), Duration::from_millis(50));
        (port, Supply::new(handle, opc, SafetyLimits::new(550.0, 1.0)))
    }

    fn writes(port: &SimPort<SupplyModel>) -> Vec<String> {
        port.calls()
            .into_iter()
            .filter(|c| c != "*OPC?" && c != "SYST:ERR?")
            .collect()
    }

    #[test]
    fn test_ramp_plan_duration() {
        let plan = RampPlan::compute(0.0, 100.0, 10.0).unwrap();
        assert_eq!(plan.duration, 10.0);
        let down = RampPlan::compute(100.0, 40.0, 20.0).unwrap();
        assert_eq!(down.duration, 3.0);
        assert!(RampPlan::compute(0.0, 1.0, 0.0).is_err());
    }

    #[tokio::test]
    async fn test_set_voltage_raises_protection_first() {
        let (port, psu) = supply();

        psu.set_voltage(5.0).await.unwrap();

        assert_eq!(writes(&port), vec!["SOUR:VOLT:PROT:LEV 6", "SOUR:VOLT 5"]);
        assert_eq!(psu.voltage_setpoint().await.unwrap(), 5.0);
        assert_eq!(psu.protection_level().await.unwrap(), 6.0);
    }

    #[tokio::test]
    async fn test_set_current_at_ceiling_never_reaches_device() {
        let (port, psu) = supply();

        let err = psu.set_current(550.0).await.unwrap_err();

        assert!(matches!(err, DaqError::SafetyLimitExceeded { .. }));
        assert!(port.calls().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_ceiling_rejection_is_logged() {
        let (_port, psu) = supply();

        assert!(psu.plan_ramp(600.0, 10.0).await.is_err());
        assert!(logs_contain("Refusing current at or above ceiling"));
    }

    #[tokio::test]
    async fn test_plan_ramp_arms_after_confirmation() {
        let (port, psu) = supply();

        let plan = psu.plan_ramp(100.0, 10.0).await.unwrap();

        assert_eq!(plan.duration, 10.0);
        assert!(psu.is_armed());
        assert_eq!(
            writes(&port),
            vec![
                "SOUR:CURR?",
                "SOUR:CURR:MODE WAVE",
                "SOUR:CURR:MODE?",
                "WAVE:CURR 100",
                "WAVE:CURR?",
                "WAVE:TIME 10",
                "WAVE:TIME?",
                "INIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_plan_ramp_readback_mismatch_leaves_unarmed() {
        let (port, psu) = supply();
        port.with_model(|m| m.current_readback_skew = 0.001);

        let err = psu.plan_ramp(100.0, 10.0).await.unwrap_err();

        assert!(matches!(
            err,
            DaqError::ReadbackMismatch { parameter: "wave current", .. }
        ));
        assert!(!psu.is_armed());
        assert_eq!(psu.phase(), RampPhase::Idle);
        assert!(!port.calls().contains(&"INIT".to_string()));
    }

    #[tokio::test]
    async fn test_plan_ramp_time_readback_mismatch_leaves_unarmed() {
        let (port, psu) = supply();
        port.with_model(|m| m.time_readback_skew = 0.5);

        let err = psu.plan_ramp(100.0, 10.0).await.unwrap_err();

        match err {
            DaqError::ReadbackMismatch { parameter, written, read, .. } => {
                assert_eq!(parameter, "wave time");
                assert_eq!(written, "10");
                assert_eq!(read, "10.5");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!psu.is_armed());
        assert_eq!(psu.phase(), RampPhase::Idle);
        let calls = port.calls();
        assert!(calls.contains(&"WAVE:CURR 100".to_string()));
        assert!(calls.contains(&"WAVE:TIME 10".to_string()));
        assert!(!calls.contains(&"INIT".to_string()));
        assert!(psu.trigger().await.is_err());
    }

    #[tokio::test]
    async fn test_plan_ramp_instrument_error_aborts_sequence() {
        let (port, psu) = supply();
        port.with_model(|m| m.fail_next(-221, "Settings conflict"));

        let err = psu.plan_ramp(100.0, 10.0).await.unwrap_err();

        assert!(matches!(err, DaqError::InstrumentError { code: -221, .. }));
        assert!(!psu.is_armed());
        // the failing read is followed only by its confirmation
        assert_eq!(writes(&port), vec!["SOUR:CURR?"]);
    }

    #[tokio::test]
    async fn test_trigger_requires_armed_ramp() {
        let (port, psu) = supply();

        let err = psu.trigger().await.unwrap_err();

        assert!(matches!(err, DaqError::NotArmed));
        assert!(port.calls().is_empty());
    }

    #[tokio::test]
    async fn test_triggered_ramp_returns_to_idle() {
        let (port, psu) = supply();
        psu.plan_ramp(1.0, 100.0).await.unwrap();

        psu.trigger().await.unwrap();
        assert_eq!(psu.phase(), RampPhase::Ramping);
        assert_eq!(port.with_model(|m| m.ramps_started), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(psu.phase(), RampPhase::Idle);
        assert!(matches!(psu.trigger().await, Err(DaqError::NotArmed)));
    }

    #[tokio::test]
    async fn test_shutdown_clears_armed_ramp() {
        let (port, psu) = supply();
        psu.set_output(true).await.unwrap();
        psu.plan_ramp(50.0, 5.0).await.unwrap();

        psu.shutdown().await.unwrap();

        assert_eq!(psu.phase(), RampPhase::Shutdown);
        assert!(matches!(psu.trigger().await, Err(DaqError::NotArmed)));
        let state = psu.status().await.unwrap();
        assert!(!state.output_enabled);
        assert_eq!(state.current_setpoint, 0.0);
        assert!(!state.armed);
        assert_eq!(port.with_model(|m| m.ramps_started), 0);
    }

    #[tokio::test]
    async fn test_initialize_sequence() {
        let (port, psu) = supply();

        psu.initialize(0.4).await.unwrap();

        assert_eq!(
            writes(&port),
            vec![
                "*CLS",
                "*RST",
                "SOUR:VOLT:PROT:LEV 1.4",
                "SOUR:VOLT 0.4",
                "SOUR:CURR 0",
                "OUTP:STAT ON",
            ]
        );
        assert!(psu.output_enabled().await.unwrap());
    }

    #[test]
    fn test_parse_output_state() {
        assert!(parse_output_state("ON").unwrap());
        assert!(parse_output_state("1").unwrap());
        assert!(!parse_output_state("0").unwrap());
        assert!(!parse_output_state("OFF").unwrap());
        assert!(parse_output_state("maybe").is_err());
    }
}
