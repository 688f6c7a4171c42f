//! Destinations for sample records.
//!
//! The scheduler writes every record to each sink in turn. A failing sink
//! reports `SinkWriteFailure` and is tried again on the next tick; it never
//! blocks the others.

mod csv_log;
mod influx;

pub use csv_log::{read_log, CsvLogSink, RunHeader};
pub use influx::{encode_line, InfluxSink};

use crate::error::AppResult;
use crate::record::SampleRecord;
use async_trait::async_trait;

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Name used in logs and `SinkWriteFailure`.
    fn name(&self) -> &str;

    async fn write(&mut self, record: &SampleRecord) -> AppResult<()>;

    /// Flush and release. Further writes fail.
    async fn close(&mut self) -> AppResult<()>;
}
