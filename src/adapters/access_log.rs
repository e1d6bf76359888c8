use std::{
    io::Write,
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Local, TimeZone};

use crate::ports::access_log::{AccessLog, AccessLogEntry};

/// Render one access-log line, timestamp first.
///
/// `2024/05/01 12:00:00 [200]: GET http://a.example.com/foo (42 bytes)`
pub fn format_line<Tz>(entry: &AccessLogEntry, at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{} [{}]: {} {}://{}{} ({} bytes)",
        at.format("%Y/%m/%d %H:%M:%S"),
        entry.status.as_u16(),
        entry.method,
        entry.scheme,
        entry.host,
        entry.path,
        entry.bytes
    )
}

/// Plain text lines on stdout, stamped with local time.
#[derive(Debug, Default)]
pub struct StdoutAccessLog;

impl AccessLog for StdoutAccessLog {
    fn record(&self, entry: &AccessLogEntry) {
        let line = format_line(entry, &Local::now());
        let mut out = std::io::stdout().lock();
        if let Err(e) = writeln!(out, "{line}") {
            tracing::debug!(error = %e, "Failed to write access log line");
        }
    }
}

/// Structured `tracing` events under the `access_log` target.
#[derive(Debug, Default)]
pub struct TracingAccessLog;

impl AccessLog for TracingAccessLog {
    fn record(&self, entry: &AccessLogEntry) {
        tracing::info!(
            target: "access_log",
            status = entry.status.as_u16(),
            method = %entry.method,
            scheme = entry.scheme,
            host = %entry.host,
            path = %entry.path,
            bytes = entry.bytes,
            duration_ms = entry.duration.as_millis() as u64,
            "request completed"
        );
    }
}

/// Keeps every entry in memory.
#[derive(Debug, Default)]
pub struct MemoryAccessLog {
    entries: Mutex<Vec<AccessLogEntry>>,
}

impl MemoryAccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the entries recorded so far, in completion order.
    pub fn entries(&self) -> Vec<AccessLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AccessLog for MemoryAccessLog {
    fn record(&self, entry: &AccessLogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
    }
}
