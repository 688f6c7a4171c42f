//! SCPI command discipline.
//!
//! [`Exchange`] wraps a borrowed transport for the duration of one session
//! transaction and adds the confirmation step the supply needs after every
//! command: poll `*OPC?` until it reports `1`, then read `SYST:ERR?` and fail
//! with `InstrumentError` on a non-zero code. Devices without an [`OpcPolicy`]
//! (the voltmeter) get plain write/query.
//!
//! Nothing here retries. A failed confirmation ends the surrounding operation.

mod voltmeter;

pub use voltmeter::Voltmeter;

use crate::error::{AppResult, DaqError, Device};
use crate::session::Transport;
use std::time::Duration;
use tracing::debug;

/// Bounded operation-complete polling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpcPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl OpcPolicy {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }
}

impl Default for OpcPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_secs(5))
    }
}

/// Parse a numeric instrument response.
pub fn parse_number(device: Device, response: &str) -> AppResult<f64> {
    response
        .trim()
        .parse::<f64>()
        .map_err(|_| DaqError::ParseError {
            device,
            response: response.to_string(),
        })
}

/// Parse a `SYST:ERR?` reply of the form `<code>,"<message>"`.
pub fn parse_error_queue(device: Device, response: &str) -> AppResult<(i32, String)> {
    let (code, message) = match response.trim().split_once(',') {
        Some((code, message)) => (code, message.trim().trim_matches('"').to_string()),
        None => (response.trim(), String::new()),
    };
    let code = code.trim().parse::<i32>().map_err(|_| DaqError::ParseError {
        device,
        response: response.to_string(),
    })?;
    Ok((code, message))
}

/// One logical conversation with an instrument, run inside a session transaction.
pub struct Exchange<'a> {
    io: &'a mut (dyn Transport + 'static),
    device: Device,
    opc: Option<OpcPolicy>,
}

impl<'a> Exchange<'a> {
    pub fn new(io: &'a mut (dyn Transport + 'static), device: Device, opc: Option<OpcPolicy>) -> Self {
        Self { io, device, opc }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Write without confirmation.
    pub async fn raw_write(&mut self, command: &str) -> AppResult<()> {
        debug!(device = %self.device, command, "SCPI write");
        self.io.send(command).await
    }

    /// Query without confirmation.
    pub async fn raw_query(&mut self, command: &str) -> AppResult<String> {
        self.io.send(command).await?;
        let response = self.io.recv().await?;
        debug!(device = %self.device, command, response = %response, "SCPI query");
        Ok(response)
    }

    /// Poll `*OPC?` until `1` or the policy timeout elapses.
    pub async fn wait_opc(&mut self, policy: OpcPolicy) -> AppResult<()> {
        let deadline = tokio::time::Instant::now() + policy.timeout;
        loop {
            if self.raw_query("*OPC?").await?.trim() == "1" {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DaqError::TransportTimeout {
                    device: self.device,
                    operation: "*OPC?".to_string(),
                });
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    /// Read one entry of the error queue; fail on a non-zero code.
    pub async fn check_error(&mut self) -> AppResult<()> {
        let response = self.raw_query("SYST:ERR?").await?;
        let (code, message) = parse_error_queue(self.device, &response)?;
        if code != 0 {
            return Err(DaqError::InstrumentError {
                device: self.device,
                code,
                message,
            });
        }
        Ok(())
    }

    async fn confirm(&mut self) -> AppResult<()> {
        if let Some(policy) = self.opc {
            self.wait_opc(policy).await?;
            self.check_error().await?;
        }
        Ok(())
    }

    /// Write a command and confirm it completed without error.
    pub async fn execute(&mut self, command: &str) -> AppResult<()> {
        self.raw_write(command).await?;
        self.confirm().await
    }

    /// Query and confirm. The response is returned only after confirmation.
    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        let response = self.raw_query(command).await?;
        self.confirm().await?;
        Ok(response)
    }

    pub async fn query_f64(&mut self, command: &str) -> AppResult<f64> {
        let response = self.query(command).await?;
        parse_number(self.device, &response)
    }
}
