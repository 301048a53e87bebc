//! JSONL request-log files with date and line-count rotation.
//!
//! One record per line; a new file is opened when the date changes or the
//! current file reaches `max_lines_per_file`, with a three-digit per-day
//! index. Filenames follow `{service}_{YYYY-MM-DD}_{HHmmss}_{NNN}.log`.
//! Write failures are reported on stderr and swallowed; request handling is
//! never affected by log-file trouble.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::error;

use crate::analytics::RequestLog;

/// Default rotation threshold.
pub const DEFAULT_MAX_LINES: usize = 10_000;

/// Severity derived from the response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// `<400` info, `<500` warn, `==503` fatal, else error.
    pub fn from_status(status: u16) -> Self {
        if status < 400 {
            LogLevel::Info
        } else if status < 500 {
            LogLevel::Warn
        } else if status == 503 {
            LogLevel::Fatal
        } else {
            LogLevel::Error
        }
    }
}

/// On-disk record schema.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileRecord<'a> {
    timestamp: String,
    level: LogLevel,
    service: &'a str,
    method: &'a str,
    path: &'a str,
    status_code: u16,
    response_time: u64,
    request_id: &'a str,
    client_id: &'a str,
    ip: &'a str,
    authenticated: bool,
}

struct WriterState {
    date: NaiveDate,
    index: u32,
    lines: usize,
    file: Option<File>,
}

/// Rotating JSONL logger for completed requests.
pub struct FileLogger {
    service: String,
    dir: PathBuf,
    max_lines: usize,
    state: Mutex<WriterState>,
}

impl FileLogger {
    pub fn new(service: impl Into<String>, dir: PathBuf, max_lines: usize) -> Self {
        Self {
            service: service.into(),
            dir,
            max_lines: max_lines.max(1),
            state: Mutex::new(WriterState {
                date: NaiveDate::MIN,
                index: 0,
                lines: 0,
                file: None,
            }),
        }
    }

    /// Append one record, rotating first if needed.
    pub fn log(&self, record: &RequestLog, request_id: &str) {
        let now = Utc::now();
        let line = FileRecord {
            timestamp: now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: LogLevel::from_status(record.status_code),
            service: &self.service,
            method: &record.method,
            path: &record.path,
            status_code: record.status_code,
            response_time: record.response_time,
            request_id,
            client_id: &record.client_id,
            ip: &record.ip,
            authenticated: record.authenticated,
        };
        let json = match serde_json::to_string(&line) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialize file log record");
                return;
            }
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let today = now.date_naive();

        if state.file.is_none() || state.date != today || state.lines >= self.max_lines {
            if state.date != today {
                state.index = 0;
            }
            state.index += 1;
            state.date = today;
            state.lines = 0;
            let name = format!(
                "{}_{}_{}_{:03}.log",
                self.service,
                today.format("%Y-%m-%d"),
                now.format("%H%M%S"),
                state.index
            );
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(&name))
            {
                Ok(file) => state.file = Some(file),
                Err(e) => {
                    error!(file = %name, error = %e, "failed to open log file");
                    state.file = None;
                }
            }
        }

        if let Some(file) = state.file.as_mut()
            && let Err(e) = writeln!(file, "{json}")
        {
            error!(error = %e, "failed to write log record");
        }
        state.lines += 1;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn record(status: u16) -> RequestLog {
        RequestLog {
            timestamp: 0,
            method: "GET".to_string(),
            path: "/a".to_string(),
            status_code: status,
            response_time: 12,
            client_id: "10.0.0.1".to_string(),
            ip: "10.0.0.1".to_string(),
            api_key: None,
            authenticated: false,
        }
    }

    #[test]
    fn level_derivation() {
        assert_eq!(LogLevel::from_status(200), LogLevel::Info);
        assert_eq!(LogLevel::from_status(399), LogLevel::Info);
        assert_eq!(LogLevel::from_status(404), LogLevel::Warn);
        assert_eq!(LogLevel::from_status(500), LogLevel::Error);
        assert_eq!(LogLevel::from_status(503), LogLevel::Fatal);
        assert_eq!(LogLevel::from_status(504), LogLevel::Error);
    }

    #[test]
    fn writes_one_json_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FileLogger::new("testsvc", dir.path().to_path_buf(), DEFAULT_MAX_LINES);
        logger.log(&record(200), "req-1");
        logger.log(&record(503), "req-2");

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("testsvc_"));
        assert!(name.ends_with("_001.log"));

        let contents = std::fs::read_to_string(&entries[0]).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["level"], "info");
        assert_eq!(first["statusCode"], 200);
        assert_eq!(first["requestId"], "req-1");
        assert_eq!(first["service"], "testsvc");

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["level"], "fatal");
    }

    #[test]
    fn rotates_after_max_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FileLogger::new("testsvc", dir.path().to_path_buf(), 2);
        for i in 0..5 {
            logger.log(&record(200), &format!("req-{i}"));
        }

        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names.len(), 3);
        assert!(names[0].ends_with("_001.log"));
        assert!(names[1].ends_with("_002.log"));
        assert!(names[2].ends_with("_003.log"));
    }
}
