//! Analog digitizer and the optional temperature monitor.
//!
//! Both are read only by the acquisition scheduler, one query per tick.

use crate::error::{AppResult, DaqError, Device};
use crate::protocol::{parse_number, Exchange};
use crate::session::SessionHandle;
use tracing::debug;

/// Multi-channel digitizer read with a single synchronized query.
#[derive(Debug, Clone)]
pub struct Digitizer {
    session: SessionHandle,
    read_command: String,
    channels: usize,
}

impl Digitizer {
    pub fn new(session: SessionHandle, read_command: impl Into<String>, channels: usize) -> Self {
        Self {
            session,
            read_command: read_command.into(),
            channels,
        }
    }

    pub async fn identify(&self) -> AppResult<String> {
        self.session.query("*IDN?").await
    }

    /// Read every channel at once. The reply must carry exactly one value per channel.
    pub async fn read_channels(&self) -> AppResult<Vec<f64>> {
        let response = self.session.query(&self.read_command).await?;
        let values = response
            .split(',')
            .map(|field| parse_number(Device::Digitizer, field))
            .collect::<AppResult<Vec<f64>>>()?;

        if values.len() != self.channels {
            return Err(DaqError::ParseError {
                device: Device::Digitizer,
                response,
            });
        }
        debug!(?values, "Digitizer reading");
        Ok(values)
    }
}

/// Two-input temperature monitor reporting Kelvin.
#[derive(Debug, Clone)]
pub struct Thermometer {
    session: SessionHandle,
    inputs: [String; 2],
}

impl Thermometer {
    pub fn new(session: SessionHandle, inputs: [String; 2]) -> Self {
        Self { session, inputs }
    }

    pub async fn read_kelvin(&self, input: &str) -> AppResult<f64> {
        let response = self.session.query(&format!("KRDG? {}", input)).await?;
        parse_number(Device::Thermometer, &response)
    }

    /// Both configured inputs, in order, in one transaction.
    pub async fn read_pair(&self) -> AppResult<(f64, f64)> {
        let [first, second] = self.inputs.clone();
        let (first, second) = self
            .session
            .transaction(move |io| {
                Box::pin(async move {
                    let mut ex = Exchange::new(io, Device::Thermometer, None);
                    let first = ex.raw_query(&format!("KRDG? {}", first)).await?;
                    let second = ex.raw_query(&format!("KRDG? {}", second)).await?;
                    Ok((first, second))
                })
            })
            .await?;

        let pair = (
            parse_number(Device::Thermometer, &first)?,
            parse_number(Device::Thermometer, &second)?,
        );
        debug!(t0 = pair.0, t180 = pair.1, "Temperature pair");
        Ok(pair)
    }
}
