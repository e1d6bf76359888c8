pub mod access_log;
pub mod http_client;
pub mod http_handler;
pub mod hyper_sink;

/// Re-export commonly used types from adapters
pub use access_log::{MemoryAccessLog, StdoutAccessLog, TracingAccessLog};
pub use http_client::HttpClientAdapter;
pub use http_handler::ProxyHandler;
pub use hyper_sink::{HyperResponseSink, PendingResponse};
