//! hostgate - a host-routed HTTP reverse proxy.
//!
//! Every request is forwarded to the backend configured for its `Host`
//! header, with an optional `*` entry catching unknown hosts. Responses are
//! streamed back unbuffered, protocol upgrades are relayed, and each request
//! ends in exactly one access-log entry carrying the status and byte count
//! the client actually received.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use hostgate::{
//!     Dispatcher, HttpClientAdapter, ProxyHandler, RoutingTable, Server, ServerSettings,
//!     StdoutAccessLog,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = hostgate::config::load_config("config.toml")?;
//! let table = RoutingTable::build(config.entries())?;
//! let dispatcher = Dispatcher::new(table, Arc::new(HttpClientAdapter::new()?));
//! let router = ProxyHandler::new(Arc::new(dispatcher), Arc::new(StdoutAccessLog)).router();
//!
//! let server = Arc::new(Server::bind(ServerSettings::new(":8080"), router).await?);
//! server.run_until(hostgate::utils::wait_for_interrupt()).await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Ports (traits) in [`ports`] are implemented by [`adapters`]; routing,
//! forwarding and response instrumentation live in [`core`]. The
//! [`server`] module owns the listener and the bind/serve/drain lifecycle.
//!
//! # Error Handling
//! Library APIs return `thiserror` enums per layer; the binary reports them
//! through `color-eyre`.
pub mod adapters;
pub mod config;
pub mod core;
pub mod ports;
pub mod server;
pub mod tracing_setup;
pub mod utils;

pub use crate::{
    adapters::{HttpClientAdapter, MemoryAccessLog, ProxyHandler, StdoutAccessLog, TracingAccessLog},
    core::{Dispatcher, ForwardHandler, InstrumentedSink, RoutingTable},
    ports::{AccessLog, AccessLogEntry, HttpClient, ResponseSink},
    server::{Phase, Server, ServerSettings, TlsMaterial},
};
