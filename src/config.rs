//! Run configuration using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (the bench as it is normally wired)
//! 2. TOML file (default: `config/coil_daq.toml`)
//! 3. Environment variables prefixed with `COILDAQ_`, nested keys split on `__`
//! 4. `INFLUX_URL`, `INFLUX_ORG`, `INFLUX_BUCKET_NAME`, `INFLUX_TOKEN`
//!
//! ```text
//! COILDAQ_SAFETY__CURRENT_CEILING=400
//! COILDAQ_SUPPLY__ADDRESS=192.168.0.201:8003
//! INFLUX_TOKEN=...
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/coil_daq.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationConfig,
    pub voltmeter: VoltmeterConfig,
    pub supply: SupplyConfig,
    pub digitizer: DigitizerConfig,
    pub thermometer: ThermometerConfig,
    pub safety: SafetyConfig,
    pub acquisition: AcquisitionConfig,
    pub influx: InfluxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory the run log is written to
    pub output_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "coil_daq".to_string(),
            log_level: "info".to_string(),
            output_dir: PathBuf::from("."),
        }
    }
}

/// Parity for the voltmeter serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    None,
    Even,
    Odd,
}

/// Nanovoltmeter on RS-232.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoltmeterConfig {
    /// Serial device (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: SerialParity,
    pub timeout_ms: u64,
    pub read_terminator: String,
    pub write_terminator: String,
    /// Input channel sampled every tick
    pub channel: u8,
    /// Delay between channel select and `:READ?`
    pub settle_ms: u64,
    pub nplc: f64,
    pub range: f64,
}

impl Default for VoltmeterConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyS3".to_string(),
            baud_rate: 19200,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            timeout_ms: 5000,
            read_terminator: "\r".to_string(),
            write_terminator: "\r".to_string(),
            channel: 1,
            settle_ms: 100,
            nplc: 2.0,
            range: 0.001,
        }
    }
}

/// Programmable supply on a raw SCPI socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupplyConfig {
    /// host:port of the SCPI socket
    pub address: String,
    pub timeout_ms: u64,
    pub read_terminator: String,
    pub write_terminator: String,
    /// Voltage programmed during initialisation
    pub initial_voltage: f64,
    pub opc_poll_interval_ms: u64,
    pub opc_timeout_ms: u64,
}

impl Default for SupplyConfig {
    fn default() -> Self {
        Self {
            address: "192.168.0.201:8003".to_string(),
            timeout_ms: 5000,
            read_terminator: "\n".to_string(),
            write_terminator: "\n".to_string(),
            initial_voltage: 0.4,
            opc_poll_interval_ms: 10,
            opc_timeout_ms: 5000,
        }
    }
}

/// Analog digitizer reached through a line-oriented network endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitizerConfig {
    pub address: String,
    pub timeout_ms: u64,
    pub read_terminator: String,
    pub write_terminator: String,
    /// Query returning one comma-separated value per channel
    pub read_command: String,
    pub channels: usize,
    /// Scale applied to channel 1 to report the supply's sensed output voltage
    pub vmeas_scale: f64,
}

impl Default for DigitizerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:5025".to_string(),
            timeout_ms: 2000,
            read_terminator: "\n".to_string(),
            write_terminator: "\n".to_string(),
            read_command: "READ? (@0,1)".to_string(),
            channels: 2,
            vmeas_scale: 1.0,
        }
    }
}

/// Optional temperature monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermometerConfig {
    pub enabled: bool,
    pub address: String,
    pub timeout_ms: u64,
    /// Inputs reported as `Temp_0` and `Temp_180`
    pub inputs: [String; 2],
}

impl Default for ThermometerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "192.168.1.20:7777".to_string(),
            timeout_ms: 5000,
            inputs: ["A".to_string(), "B".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Hard current ceiling in amps; requests at or above it are refused
    pub current_ceiling: f64,
    /// Volts added to the setpoint to form the over-voltage protection level
    pub protection_margin: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            current_ceiling: 550.0,
            protection_margin: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Target tick period
    pub period_ms: u64,
    /// Pause between consecutive supply reads
    pub pacing_ms: u64,
    /// Set the supply current to zero and disable output when the run ends
    pub shutdown_supply_on_exit: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            period_ms: 300,
            pacing_ms: 100,
            shutdown_supply_on_exit: false,
        }
    }
}

impl AcquisitionConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub enabled: bool,
    pub url: String,
    pub org: String,
    pub bucket_name: String,
    pub token: String,
    pub measurement: String,
    pub timeout_ms: u64,
    /// Points buffered for the background writer before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:8086".to_string(),
            org: String::new(),
            bucket_name: String::new(),
            token: String::new(),
            measurement: "Coil_Testing".to_string(),
            timeout_ms: 2000,
            queue_capacity: 256,
        }
    }
}

impl Settings {
    /// Load from the default path, environment overrides applied.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific TOML file. A missing file falls back to defaults.
    pub fn load_from(path: impl AsRef<Path>) -> AppResult<Self> {
        Self::from_figment(
            Self::base_figment()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("COILDAQ_").split("__"))
                .merge(Env::prefixed("INFLUX_").map(|key| format!("influx.{}", key).into())),
        )
    }

    /// Build from an inline TOML string (no environment), used by tests and tooling.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Self::from_figment(Self::base_figment().merge(Toml::string(toml)))
    }

    fn base_figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
    }

    fn from_figment(figment: Figment) -> AppResult<Self> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        if settings.influx_credentials_ignored() {
            warn!("Influx credentials are set but influx.enabled is false; points will not be sent");
        }
        Ok(settings)
    }

    /// True when a token was supplied (usually through `INFLUX_TOKEN`) while the
    /// sink itself stays disabled.
    pub fn influx_credentials_ignored(&self) -> bool {
        !self.influx.enabled && !self.influx.token.is_empty()
    }

    /// Semantic checks performed before any session is opened.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.safety.current_ceiling > 0.0) {
            return Err(DaqError::Configuration(format!(
                "safety.current_ceiling must be positive, got {}",
                self.safety.current_ceiling
            )));
        }
        if self.safety.protection_margin < 0.0 {
            return Err(DaqError::Configuration(
                "safety.protection_margin must not be negative".to_string(),
            ));
        }
        if self.acquisition.period_ms == 0 {
            return Err(DaqError::Configuration(
                "acquisition.period_ms must be greater than zero".to_string(),
            ));
        }
        for (name, term) in [
            ("voltmeter.read_terminator", &self.voltmeter.read_terminator),
            ("voltmeter.write_terminator", &self.voltmeter.write_terminator),
            ("supply.read_terminator", &self.supply.read_terminator),
            ("supply.write_terminator", &self.supply.write_terminator),
            ("digitizer.read_terminator", &self.digitizer.read_terminator),
            ("digitizer.write_terminator", &self.digitizer.write_terminator),
        ] {
            if term.is_empty() {
                return Err(DaqError::Configuration(format!("{} must not be empty", name)));
            }
        }
        if self.digitizer.channels < 2 {
            return Err(DaqError::Configuration(
                "digitizer.channels must be at least 2".to_string(),
            ));
        }
        if self.supply.opc_poll_interval_ms == 0 || self.supply.opc_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "supply OPC poll interval and timeout must be non-zero".to_string(),
            ));
        }
        if self.influx.enabled && (self.influx.bucket_name.is_empty() || self.influx.org.is_empty()) {
            return Err(DaqError::Configuration(
                "influx.org and influx.bucket_name are required when influx is enabled".to_string(),
            ));
        }
        if self.influx.enabled && self.influx.queue_capacity == 0 {
            return Err(DaqError::Configuration(
                "influx.queue_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
