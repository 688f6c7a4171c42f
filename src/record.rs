//! One merged sample per scheduler tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Column order of the run log.
pub const COLUMNS: [&str; 9] = [
    "Timestamp",
    "Channel1_V",
    "PSU_Iout_A",
    "PSU_Vout_V",
    "PSU_Vout_MEAS",
    "Digitizer_Ch0",
    "Digitizer_Ch1",
    "Temp_0",
    "Temp_180",
];

/// A timestamped reading of every instrument.
///
/// A field is `None` when its read failed on that tick; the rest of the record
/// is still logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Captured before the first read of the tick
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Voltmeter channel 1
    #[serde(rename = "Channel1_V")]
    pub channel1_v: Option<f64>,
    /// Measured supply output current
    #[serde(rename = "PSU_Iout_A")]
    pub psu_iout_a: Option<f64>,
    /// Programmed supply voltage
    #[serde(rename = "PSU_Vout_V")]
    pub psu_vout_v: Option<f64>,
    /// Supply output voltage sensed through the digitizer
    #[serde(rename = "PSU_Vout_MEAS")]
    pub psu_vout_meas: Option<f64>,
    #[serde(rename = "Digitizer_Ch0")]
    pub digitizer_ch0: Option<f64>,
    #[serde(rename = "Digitizer_Ch1")]
    pub digitizer_ch1: Option<f64>,
    #[serde(rename = "Temp_0")]
    pub temp_0: Option<f64>,
    #[serde(rename = "Temp_180")]
    pub temp_180: Option<f64>,
}

impl SampleRecord {
    /// Record with only a timestamp; fields are filled as reads complete.
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            channel1_v: None,
            psu_iout_a: None,
            psu_vout_v: None,
            psu_vout_meas: None,
            digitizer_ch0: None,
            digitizer_ch1: None,
            temp_0: None,
            temp_180: None,
        }
    }

    /// Fields that could not be read this tick.
    pub fn missing_fields(&self) -> usize {
        [
            self.channel1_v,
            self.psu_iout_a,
            self.psu_vout_v,
            self.psu_vout_meas,
            self.digitizer_ch0,
            self.digitizer_ch1,
            self.temp_0,
            self.temp_180,
        ]
        .iter()
        .filter(|v| v.is_none())
        .count()
    }
}
