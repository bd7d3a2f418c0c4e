//! FileSink - appends completed runs to daily JSON Lines files
//!
//! Each record lands in `<base_path>/<prefix>-<YYYY-MM-DD>.jsonl`, dated by
//! the run's UTC completion time.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use contracts::{ContractError, ResultSink, RunRecord};
use serde::Serialize;
use tracing::{debug, error, instrument};

#[derive(Debug, Clone)]
pub struct FileSinkConfig {
    /// Output directory
    pub base_path: PathBuf,
    /// File name prefix
    pub prefix: String,
}

impl FileSinkConfig {
    /// Read `base_path` and `prefix` params, falling back to `./results` and `runs`.
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let base_path = params
            .get("base_path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./results"));
        let prefix = params
            .get("prefix")
            .cloned()
            .unwrap_or_else(|| "runs".to_string());

        Self { base_path, prefix }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunLine<'a> {
    completed_at: String,
    total_seconds: f64,
    #[serde(flatten)]
    record: &'a RunRecord,
}

struct OpenFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

/// Sink that persists each run as one JSON line
pub struct FileSink {
    name: String,
    config: FileSinkConfig,
    current: Option<OpenFile>,
}

impl FileSink {
    pub fn new(name: impl Into<String>, config: FileSinkConfig) -> std::io::Result<Self> {
        fs::create_dir_all(&config.base_path)?;
        Ok(Self {
            name: name.into(),
            config,
            current: None,
        })
    }

    pub fn from_params(
        name: impl Into<String>,
        params: &HashMap<String, String>,
    ) -> std::io::Result<Self> {
        Self::new(name, FileSinkConfig::from_params(params))
    }

    fn completed_at(record: &RunRecord) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(record.completed_at_unix_ms).unwrap_or_default()
    }

    /// Path of the file that holds runs completed at `at`.
    pub fn path_for(&self, at: DateTime<Utc>) -> PathBuf {
        self.config.base_path.join(format!(
            "{}-{}.jsonl",
            self.config.prefix,
            at.format("%Y-%m-%d")
        ))
    }

    fn writer_for(&mut self, path: PathBuf) -> std::io::Result<&mut BufWriter<File>> {
        let reopen = self.current.as_ref().map_or(true, |f| f.path != path);
        if reopen {
            if let Some(mut previous) = self.current.take() {
                previous.writer.flush()?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            debug!(sink = %self.name, path = %path.display(), "opened result file");
            self.current = Some(OpenFile {
                path,
                writer: BufWriter::new(file),
            });
        }
        match self.current.as_mut() {
            Some(open) => Ok(&mut open.writer),
            None => Err(std::io::Error::other("result file not open")),
        }
    }

    fn append(&mut self, record: &RunRecord) -> std::io::Result<()> {
        let at = Self::completed_at(record);
        let line = RunLine {
            completed_at: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            total_seconds: record.total_seconds(),
            record,
        };
        let path = self.path_for(at);
        let writer = self.writer_for(path)?;
        serde_json::to_writer(&mut *writer, &line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn persist(&mut self, record: &RunRecord) -> Result<(), ContractError> {
        self.append(record).map_err(|e| {
            error!(sink = %self.name, run_id = %record.run_id, error = %e, "append failed");
            ContractError::sink_write(&self.name, e.to_string())
        })
    }
}

impl ResultSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "file_sink_write",
        skip(self, record),
        fields(sink = %self.name, run_id = %record.run_id)
    )]
    async fn write(&mut self, record: &RunRecord) -> Result<(), ContractError> {
        self.persist(record)?;
        // flushed per run
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), ContractError> {
        if let Some(open) = self.current.as_mut() {
            open.writer
                .flush()
                .map_err(|e| ContractError::sink_write(&self.name, e.to_string()))?;
        }
        Ok(())
    }

    #[instrument(name = "file_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), ContractError> {
        self.flush().await?;
        self.current = None;
        debug!(sink = %self.name, "FileSink closed");
        Ok(())
    }
}
