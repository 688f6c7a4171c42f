//! Nanovoltmeter on a serial link.

use super::{parse_number, Exchange};
use crate::config::VoltmeterConfig;
use crate::error::{AppResult, Device};
use crate::session::SessionHandle;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Voltmeter {
    session: SessionHandle,
    settle: Duration,
}

impl Voltmeter {
    pub fn new(session: SessionHandle, settle: Duration) -> Self {
        Self { session, settle }
    }

    pub async fn identify(&self) -> AppResult<String> {
        self.session.query("*IDN?").await
    }

    /// Clear, reset and verify the error queue, then apply the measurement setup
    /// for the sampled channel.
    pub async fn configure(&self, config: &VoltmeterConfig) -> AppResult<()> {
        let chan = config.channel;
        let setup = vec![
            format!(":SENS:CHAN {}", chan),
            ":SENS:FUNC 'VOLT'".to_string(),
            ":TRIG:SOUR IMM".to_string(),
            ":TRIG:COUN INF".to_string(),
            ":DISP:ENAB ON".to_string(),
            format!(":SENS:VOLT:DC:CHAN{}:RANG {}", chan, config.range),
            format!(":SENS:VOLT:CHAN{}:NPLC {}", chan, config.nplc),
            format!(":SENS:VOLT:CHAN{}:RANG:AUTO ON", chan),
            ":SYST:AZER:STAT OFF".to_string(),
            format!(":SENS:VOLT:DC:CHAN{}:LPAS OFF", chan),
            format!(":SENS:VOLT:DC:CHAN{}:DFIL ON", chan),
        ];

        self.session
            .transaction(move |io| {
                Box::pin(async move {
                    let mut ex = Exchange::new(io, Device::Voltmeter, None);
                    ex.raw_write("*CLS").await?;
                    ex.raw_write("*RST").await?;
                    ex.check_error().await?;
                    for command in &setup {
                        ex.raw_write(command).await?;
                    }
                    Ok(())
                })
            })
            .await?;

        info!(channel = chan, nplc = config.nplc, range = config.range, "Voltmeter configured");
        Ok(())
    }

    /// Select `channel`, wait the settle delay, read and parse.
    ///
    /// Selection and read run in one transaction so no other command lands
    /// between them.
    pub async fn read_channel(&self, channel: u8) -> AppResult<f64> {
        let settle = self.settle;
        let response = self
            .session
            .transaction(move |io| {
                Box::pin(async move {
                    let mut ex = Exchange::new(io, Device::Voltmeter, None);
                    ex.raw_write(&format!(":SENS:CHAN {}", channel)).await?;
                    tokio::time::sleep(settle).await;
                    ex.raw_query(":READ?").await
                })
            })
            .await?;

        let value = parse_number(Device::Voltmeter, &response)?;
        debug!(channel, value, "Voltmeter reading");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaqError;
    use crate::session::DeviceSession;
    use crate::sim::{SimPort, VoltmeterModel};

    fn voltmeter(model: VoltmeterModel) -> (SimPort<VoltmeterModel>, Voltmeter) {
        let port = SimPort::new(Device::Voltmeter, model);
        let (handle, _task) = DeviceSession::spawn(Device::Voltmeter, Box::new(port.clone()));
        (port, Voltmeter::new(handle, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_read_channel_selects_then_reads() {
        let (port, dmm) = voltmeter(VoltmeterModel::new(2.5e-7));

        let value = dmm.read_channel(1).await.unwrap();

        assert_eq!(value, 2.5e-7);
        assert_eq!(port.calls(), vec![":SENS:CHAN 1", ":READ?"]);
    }

    #[tokio::test]
    async fn test_read_channel_rejects_non_numeric() {
        let mut model = VoltmeterModel::new(0.0);
        model.garbage = true;
        let (_port, dmm) = voltmeter(model);

        let err = dmm.read_channel(1).await.unwrap_err();
        assert!(matches!(err, DaqError::ParseError { device: Device::Voltmeter, .. }));
    }

    #[tokio::test]
    async fn test_configure_resets_before_setup() {
        let (port, dmm) = voltmeter(VoltmeterModel::new(0.0));

        dmm.configure(&VoltmeterConfig::default()).await.unwrap();

        let calls = port.calls();
        assert_eq!(&calls[..3], &["*CLS", "*RST", "SYST:ERR?"]);
        assert!(calls.contains(&":SENS:VOLT:CHAN1:NPLC 2".to_string()));
    }
}
