pub mod access_log;
pub mod http_client;
pub mod response_sink;

pub use access_log::{AccessLog, AccessLogEntry};
pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
pub use response_sink::{Hijacked, ResponseSink, SinkError, SinkResult};
