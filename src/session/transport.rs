//! Line-oriented transports for SCPI-style instruments.
//!
//! A [`Transport`] moves exactly one command line out and one response line in.
//! It knows nothing about SCPI; the protocol layer builds on top of it.

use crate::error::{AppResult, DaqError, Device};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace};

#[cfg(feature = "instrument_serial")]
use tokio_serial::SerialStream;

/// Raw command/response channel to one instrument.
///
/// Implementations are owned by a single [`DeviceSession`](super::DeviceSession)
/// task, so `&mut self` access is never shared.
#[async_trait]
pub trait Transport: Send {
    /// Write one command, appending the write terminator.
    async fn send(&mut self, line: &str) -> AppResult<()>;

    /// Read one response, stripping the read terminator and surrounding whitespace.
    ///
    /// # Errors
    /// `TransportTimeout` if nothing arrives within the configured timeout.
    async fn recv(&mut self) -> AppResult<String>;

    /// Release the underlying connection.
    async fn close(&mut self) -> AppResult<()>;
}

/// Timeout and line-termination pair fixed per instrument.
#[derive(Debug, Clone)]
pub struct LineOptions {
    pub timeout: Duration,
    pub read_terminator: String,
    pub write_terminator: String,
}

impl LineOptions {
    pub fn new(timeout: Duration, read_terminator: &str, write_terminator: &str) -> Self {
        Self {
            timeout,
            read_terminator: read_terminator.to_string(),
            write_terminator: write_terminator.to_string(),
        }
    }
}

/// [`Transport`] over any async byte stream (TCP socket, serial port).
pub struct LineTransport<S> {
    device: Device,
    stream: BufReader<S>,
    options: LineOptions,
    /// Last byte of the read terminator; responses are split on it
    delimiter: u8,
    last_command: String,
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already-open stream.
    pub fn new(device: Device, stream: S, options: LineOptions) -> AppResult<Self> {
        let delimiter = *options.read_terminator.as_bytes().last().ok_or_else(|| {
            DaqError::Configuration(format!("{}: empty read terminator", device))
        })?;

        Ok(Self {
            device,
            stream: BufReader::new(stream),
            options,
            delimiter,
            last_command: String::new(),
        })
    }

    fn io_error(&self, err: std::io::Error) -> DaqError {
        DaqError::Transport {
            device: self.device,
            reason: err.to_string(),
        }
    }
}

impl LineTransport<TcpStream> {
    /// Connect to a raw SCPI socket (`host:port`).
    pub async fn connect_tcp(device: Device, address: &str, options: LineOptions) -> AppResult<Self> {
        let stream = tokio::time::timeout(options.timeout, TcpStream::connect(address))
            .await
            .map_err(|_| DaqError::TransportTimeout {
                device,
                operation: format!("connect {}", address),
            })?
            .map_err(|e| DaqError::Transport {
                device,
                reason: format!("connect {}: {}", address, e),
            })?;
        stream.set_nodelay(true)?;

        debug!(%device, address, "TCP session opened");
        Self::new(device, stream, options)
    }
}

#[cfg(feature = "instrument_serial")]
impl LineTransport<SerialStream> {
    /// Open an RS-232 link with fixed framing.
    pub fn open_serial(
        device: Device,
        config: &crate::config::VoltmeterConfig,
        options: LineOptions,
    ) -> AppResult<Self> {
        use crate::config::SerialParity;
        use tokio_serial::SerialPortBuilderExt;

        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let parity = match config.parity {
            SerialParity::None => tokio_serial::Parity::None,
            SerialParity::Even => tokio_serial::Parity::Even,
            SerialParity::Odd => tokio_serial::Parity::Odd,
        };

        let port = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(options.timeout)
            .open_native_async()
            .map_err(|e| DaqError::Transport {
                device,
                reason: format!("open {}: {}", config.port, e),
            })?;

        debug!(%device, port = %config.port, baud = config.baud_rate, "Serial session opened");
        Self::new(device, port, options)
    }
}

#[async_trait]
impl<S> Transport for LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, line: &str) -> AppResult<()> {
        let payload = format!("{}{}", line, self.options.write_terminator);
        trace!(device = %self.device, command = line, "send");

        let writer = self.stream.get_mut();
        let write = async {
            writer.write_all(payload.as_bytes()).await?;
            writer.flush().await
        };
        tokio::time::timeout(self.options.timeout, write)
            .await
            .map_err(|_| DaqError::TransportTimeout {
                device: self.device,
                operation: line.to_string(),
            })?
            .map_err(|e| self.io_error(e))?;

        self.last_command = line.to_string();
        Ok(())
    }

    async fn recv(&mut self) -> AppResult<String> {
        let mut buf = Vec::with_capacity(64);
        let read = tokio::time::timeout(
            self.options.timeout,
            self.stream.read_until(self.delimiter, &mut buf),
        )
        .await
        .map_err(|_| DaqError::TransportTimeout {
            device: self.device,
            operation: self.last_command.clone(),
        })?
        .map_err(|e| self.io_error(e))?;

        if read == 0 {
            return Err(DaqError::Transport {
                device: self.device,
                reason: "connection closed by instrument".to_string(),
            });
        }

        let text = String::from_utf8_lossy(&buf);
        let response = text
            .trim_end_matches(self.options.read_terminator.as_str())
            .trim()
            .to_string();
        trace!(device = %self.device, response = %response, "recv");
        Ok(response)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.stream
            .get_mut()
            .shutdown()
            .await
            .map_err(|e| self.io_error(e))
    }
}
