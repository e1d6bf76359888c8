use std::time::Duration;

use hyper::{Method, StatusCode};

/// One completed request, as handed to the access log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogEntry {
    pub status: StatusCode,
    pub method: Method,
    /// `http` or `https`, depending on whether TLS was terminated here.
    pub scheme: &'static str,
    pub host: String,
    pub path: String,
    pub bytes: u64,
    pub duration: Duration,
}

/// AccessLog defines the port (interface) for the per-request log line sink.
///
/// Implementations are constructed once at startup and injected into the
/// request handler; they are called concurrently from request tasks.
pub trait AccessLog: Send + Sync + 'static {
    /// Record a completed request.
    fn record(&self, entry: &AccessLogEntry);
}
