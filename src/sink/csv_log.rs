//! Append-only run log.
//!
//! Each run appends a `# ` header line naming the instruments and the start
//! time, then the column row, then one row per record. Rows are flushed as
//! they are written so an interrupted run keeps everything up to the last tick.

use super::RecordSink;
use crate::error::{AppResult, DaqError};
use crate::record::{SampleRecord, COLUMNS};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Identities recorded at the top of each run.
#[derive(Debug, Clone)]
pub struct RunHeader {
    pub voltmeter: String,
    pub supply: String,
    pub digitizer: String,
    pub start: DateTime<Utc>,
}

impl RunHeader {
    fn line(&self) -> String {
        format!(
            "# Voltmeter: {}, Supply: {}, Digitizer: {}, Start: {}\n",
            self.voltmeter.trim(),
            self.supply.trim(),
            self.digitizer.trim(),
            self.start.to_rfc3339()
        )
    }
}

pub struct CsvLogSink {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl CsvLogSink {
    /// Open `path` for appending and write the run header.
    pub fn create(path: impl AsRef<Path>, header: &RunHeader) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(header.line().as_bytes())?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(COLUMNS)?;
        writer.flush()?;

        info!(path = %path.display(), "Run log opened");
        Ok(Self {
            path,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn failure(&self, reason: impl ToString) -> DaqError {
        DaqError::SinkWriteFailure {
            sink: self.name().to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl RecordSink for CsvLogSink {
    fn name(&self) -> &str {
        "csv"
    }

    async fn write(&mut self, record: &SampleRecord) -> AppResult<()> {
        let result = match self.writer.as_mut() {
            Some(writer) => writer
                .serialize(record)
                .map_err(|e| e.to_string())
                .and_then(|()| writer.flush().map_err(|e| e.to_string())),
            None => Err("log is closed".to_string()),
        };
        result.map_err(|reason| self.failure(reason))
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(path = %self.path.display(), "Run log closed");
        }
        Ok(())
    }
}

/// Read back every record of a log, skipping header lines of each run.
pub fn read_log(path: impl AsRef<Path>) -> AppResult<Vec<SampleRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(path)?;
    let headers = csv::StringRecord::from(COLUMNS.to_vec());

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        if row.get(0) == Some(COLUMNS[0]) {
            continue;
        }
        records.push(row.deserialize(Some(&headers))?);
    }
    Ok(records)
}
