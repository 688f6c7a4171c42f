//! InfluxDB v2 time-series sink.
//!
//! Each record becomes one line-protocol point posted to `/api/v2/write`.
//! Missing and non-finite fields are left out of the point.
//!
//! Delivery is out of band: `write` only queues the point for a background
//! writer task, so a slow or silent server never holds up an acquisition tick.
//! Points that cannot be delivered are reported on the next `write` or `close`.

use super::RecordSink;
use crate::config::InfluxConfig;
use crate::error::{AppResult, DaqError};
use crate::record::SampleRecord;
use async_trait::async_trait;
use std::fmt::Write;
use url::Url;

fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

/// Line protocol for one record, or `None` when no field has a value.
pub fn encode_line(measurement: &str, record: &SampleRecord) -> Option<String> {
    let fields = [
        ("PSU Current", record.psu_iout_a),
        ("PSU Voltage", record.psu_vout_v),
        ("NanoVolt_Ch1", record.channel1_v),
        ("AST244_v", record.digitizer_ch0),
        ("PSU V_Meas", record.psu_vout_meas),
        ("PT_000", record.temp_0),
        ("PT_180", record.temp_180),
    ];

    let mut line = escape_measurement(measurement);
    let mut first = true;
    for (key, value) in fields {
        let Some(value) = value.filter(|v| v.is_finite()) else {
            continue;
        };
        line.push(if first { ' ' } else { ',' });
        first = false;
        let _ = write!(line, "{}={}", escape_key(key), value);
    }
    if first {
        return None;
    }

    if let Some(ns) = record.timestamp.timestamp_nanos_opt() {
        let _ = write!(line, " {}", ns);
    }
    Some(line)
}

/// Write endpoint for `config`: `<url>/api/v2/write?org=..&bucket=..&precision=ns`.
///
/// Only plain `http` servers are supported.
pub fn write_url(config: &InfluxConfig) -> AppResult<Url> {
    let invalid =
        |reason: &dyn std::fmt::Display| DaqError::Configuration(format!("influx.url {:?}: {}", config.url, reason));

    let mut base = Url::parse(&config.url).map_err(|e| invalid(&e))?;
    if base.scheme() != "http" {
        return Err(invalid(&"only http:// servers are supported"));
    }
    if base.host_str().map_or(true, str::is_empty) {
        return Err(invalid(&"missing host"));
    }
    // keep any path prefix (reverse proxies) when joining
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }

    let mut url = base.join("api/v2/write").map_err(|e| invalid(&e))?;
    url.query_pairs_mut()
        .append_pair("org", &config.org)
        .append_pair("bucket", &config.bucket_name)
        .append_pair("precision", "ns");
    Ok(url)
}

fn failure(reason: impl ToString) -> DaqError {
    DaqError::SinkWriteFailure {
        sink: "influx".to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(feature = "sink_influx")]
mod enabled {
    use super::*;
    use hyper::client::HttpConnector;
    use hyper::{Body, Client, Method, Request};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, error::TrySendError};
    use tokio::task::JoinHandle;
    use tracing::{debug, info, warn};

    /// Owned by the background task; performs the HTTP round trips.
    struct Poster {
        client: Client<HttpConnector>,
        write_url: String,
        token: String,
        timeout: Duration,
    }

    impl Poster {
        async fn post(&self, line: String) -> AppResult<()> {
            let request = Request::builder()
                .method(Method::POST)
                .uri(self.write_url.as_str())
                .header("Authorization", format!("Token {}", self.token))
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(Body::from(line))
                .map_err(|e| failure(e))?;

            let response = tokio::time::timeout(self.timeout, self.client.request(request))
                .await
                .map_err(|_| failure("request timed out"))?
                .map_err(|e| failure(e))?;

            let status = response.status();
            if !status.is_success() {
                let body = hyper::body::to_bytes(response.into_body())
                    .await
                    .unwrap_or_default();
                return Err(failure(format!(
                    "HTTP {}: {}",
                    status,
                    String::from_utf8_lossy(&body).trim()
                )));
            }
            Ok(())
        }
    }

    async fn drain(mut points: mpsc::Receiver<String>, poster: Poster, undelivered: Arc<AtomicU64>) {
        while let Some(line) = points.recv().await {
            if let Err(e) = poster.post(line).await {
                undelivered.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Influx point not delivered");
            }
        }
        debug!("Influx writer drained");
    }

    pub struct InfluxSink {
        queue: Option<mpsc::Sender<String>>,
        writer: Option<JoinHandle<()>>,
        measurement: String,
        /// How long `close` waits for queued points before abandoning them
        close_grace: Duration,
        undelivered: Arc<AtomicU64>,
        reported: u64,
    }

    impl InfluxSink {
        /// Validate the endpoint and start the background writer.
        ///
        /// Must be called from within a Tokio runtime.
        pub fn new(config: &InfluxConfig) -> AppResult<Self> {
            let url = write_url(config)?;
            let timeout = Duration::from_millis(config.timeout_ms);
            let poster = Poster {
                client: Client::new(),
                write_url: url.to_string(),
                token: config.token.clone(),
                timeout,
            };

            let (queue, points) = mpsc::channel(config.queue_capacity.max(1));
            let undelivered = Arc::new(AtomicU64::new(0));
            let writer = tokio::spawn(drain(points, poster, Arc::clone(&undelivered)));

            info!(url = %config.url, bucket = %config.bucket_name, "Influx sink ready");
            Ok(Self {
                queue: Some(queue),
                writer: Some(writer),
                measurement: config.measurement.clone(),
                close_grace: timeout,
                undelivered,
                reported: 0,
            })
        }

        /// Report points the writer gave up on since the last report.
        fn take_undelivered(&mut self) -> AppResult<()> {
            let total = self.undelivered.load(Ordering::Relaxed);
            if total > self.reported {
                let missed = total - self.reported;
                self.reported = total;
                return Err(failure(format!("{} point(s) not delivered", missed)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RecordSink for InfluxSink {
        fn name(&self) -> &str {
            "influx"
        }

        async fn write(&mut self, record: &SampleRecord) -> AppResult<()> {
            let Some(queue) = &self.queue else {
                return Err(failure("sink is closed"));
            };
            if let Some(line) = encode_line(&self.measurement, record) {
                match queue.try_send(line) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        return Err(failure("write queue full, point dropped"));
                    }
                    Err(TrySendError::Closed(_)) => {
                        return Err(failure("writer task stopped"));
                    }
                }
            }
            self.take_undelivered()
        }

        async fn close(&mut self) -> AppResult<()> {
            let Some(queue) = self.queue.take() else {
                return Ok(());
            };
            let pending = queue.max_capacity() - queue.capacity();
            drop(queue);

            if let Some(mut writer) = self.writer.take() {
                match tokio::time::timeout(self.close_grace, &mut writer).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(failure(format!("writer task failed: {}", e))),
                    Err(_) => {
                        writer.abort();
                        warn!(pending, "Influx writer did not drain in time, aborting");
                        return Err(failure(format!(
                            "writer did not drain within {:?}; up to {} point(s) abandoned",
                            self.close_grace, pending
                        )));
                    }
                }
            }
            self.take_undelivered()
        }
    }
}

#[cfg(not(feature = "sink_influx"))]
mod disabled {
    use super::*;

    pub struct InfluxSink;

    impl InfluxSink {
        pub fn new(config: &InfluxConfig) -> AppResult<Self> {
            write_url(config)?;
            Err(DaqError::Configuration(
                "influx sink requires the sink_influx feature".to_string(),
            ))
        }
    }

    #[async_trait]
    impl RecordSink for InfluxSink {
        fn name(&self) -> &str {
            "influx"
        }

        async fn write(&mut self, _record: &SampleRecord) -> AppResult<()> {
            Err(failure("sink_influx feature not enabled"))
        }

        async fn close(&mut self) -> AppResult<()> {
            Ok(())
        }
    }
}

#[cfg(feature = "sink_influx")]
pub use enabled::InfluxSink;

#[cfg(not(feature = "sink_influx"))]
pub use disabled::InfluxSink;
