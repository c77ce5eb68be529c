//! Append-only event log.
//!
//! Every processed Init, Data and Heartbeat packet becomes one line, either a
//! CSV row under [`CSV_HEADER`] or a JSON object. Lines are flushed as they
//! are written so the file can be tailed by the analysis tooling while the
//! server runs.

use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use telemetry_core::event::{EventRecord, EventSink, CSV_HEADER};

use crate::TelemetryError;

#[derive(clap::ValueEnum, Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventFormat {
    #[default]
    Csv,
    Jsonl,
}

impl EventFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            EventFormat::Csv => "csv",
            EventFormat::Jsonl => "jsonl",
        }
    }
}

/// `telemetry_log_<YYYYmmdd_HHMMSS>.<ext>` in the current directory
pub fn default_log_path(format: EventFormat) -> PathBuf {
    PathBuf::from(format!(
        "telemetry_log_{}.{}",
        chrono::Local::now().format("%Y%m%d_%H%M%S"),
        format.extension()
    ))
}

pub struct EventLog {
    path: PathBuf,
    format: EventFormat,
    writer: BufWriter<File>,
    records: u64,
}

impl EventLog {
    /// Open `path` for appending. A CSV header is written if the file is new
    /// or empty.
    pub fn open(path: &Path, format: EventFormat) -> Result<Self, TelemetryError> {
        let map_err = |source| TelemetryError::EventLog {
            path: path.display().to_string(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(map_err)?;
        let empty = file.metadata().map_err(map_err)?.len() == 0;

        let mut log = EventLog {
            path: path.to_path_buf(),
            format,
            writer: BufWriter::new(file),
            records: 0,
        };
        if empty && format == EventFormat::Csv {
            writeln!(log.writer, "{}", CSV_HEADER).map_err(map_err)?;
            log.writer.flush().map_err(map_err)?;
        }

        log::info!("Writing {:?} event log to {}", format, path.display());
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written since the log was opened
    pub fn records(&self) -> u64 {
        self.records
    }
}

impl EventSink for EventLog {
    type Error = io::Error;

    fn record(&mut self, event: &EventRecord) -> Result<(), io::Error> {
        match self.format {
            EventFormat::Csv => writeln!(self.writer, "{}", event.to_csv_row())?,
            EventFormat::Jsonl => {
                serde_json::to_writer(&mut self.writer, event)?;
                self.writer.write_all(b"\n")?;
            }
        }
        self.records += 1;
        self.writer.flush()
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        self.writer.flush()
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            log::error!("Failed to flush event log {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use telemetry_core::Mode;
    use tempfile::TempDir;

    fn event(seq: u16) -> EventRecord {
        EventRecord {
            device_id: 7,
            seq,
            timestamp: 1000 + seq as u64,
            arrival_time: 2000,
            duplicate_flag: false,
            gap_flag: seq == 3,
            reorder_flag: false,
            payload_size: 4,
            is_batch: false,
            mode: Mode::Single,
        }
    }

    #[test]
    fn test_csv_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.csv");

        let mut log = EventLog::open(&path, EventFormat::Csv).unwrap();
        log.record(&event(1)).unwrap();
        log.record(&event(3)).unwrap();
        assert_eq!(log.records(), 2);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[2], "7,3,1003,2000,0,1,0,4,0,single");
    }

    #[test]
    fn test_reopen_appends_without_second_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.csv");

        {
            let mut log = EventLog::open(&path, EventFormat::Csv).unwrap();
            log.record(&event(1)).unwrap();
        }
        {
            let mut log = EventLog::open(&path, EventFormat::Csv).unwrap();
            log.record(&event(2)).unwrap();
        }

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("device_id").count(), 1);
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_jsonl_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");

        let mut log = EventLog::open(&path, EventFormat::Jsonl).unwrap();
        log.record(&event(5)).unwrap();
        drop(log);

        let content = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(value["device_id"], 7);
        assert_eq!(value["seq"], 5);
        assert_eq!(value["mode"], "single");
    }

    #[test]
    fn test_open_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("events.csv");
        assert!(matches!(
            EventLog::open(&path, EventFormat::Csv),
            Err(TelemetryError::EventLog { .. })
        ));
    }

    #[test]
    fn test_default_log_path() {
        let path = default_log_path(EventFormat::Csv);
        let name = path.to_str().unwrap();
        assert!(name.starts_with("telemetry_log_"));
        assert!(name.ends_with(".csv"));
        // telemetry_log_YYYYmmdd_HHMMSS.csv
        assert_eq!(name.len(), "telemetry_log_".len() + 15 + ".csv".len());
    }
}
