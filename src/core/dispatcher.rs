//! Host-based dispatch to per-host forward handlers.
use std::{collections::HashMap, sync::Arc};

use url::Url;

use crate::{
    config::{ConfigError, WILDCARD_HOST},
    core::{
        forward::ForwardHandler,
        routing::{BackendRoute, RoutingTable, parse_backend_url},
    },
    ports::http_client::HttpClient,
};

#[derive(Debug)]
enum Mode {
    /// Exact host first, then the wildcard.
    ByHost {
        handlers: HashMap<String, ForwardHandler>,
        wildcard: Option<ForwardHandler>,
    },
    /// Every request goes to one target.
    TargetOnly(ForwardHandler),
}

/// Chooses the [`ForwardHandler`] for a request from its Host value.
///
/// Built once at startup and shared read-only behind an `Arc`.
#[derive(Debug)]
pub struct Dispatcher {
    table: RoutingTable,
    mode: Mode,
}

impl Dispatcher {
    /// Bind every route of `table` to its own handler.
    pub fn new(table: RoutingTable, client: Arc<dyn HttpClient>) -> Self {
        let mut handlers = HashMap::with_capacity(table.len());
        let mut wildcard = None;

        for route in table.routes() {
            let handler = ForwardHandler::new(route.clone(), client.clone());
            if route.is_wildcard() {
                wildcard = Some(handler);
            } else {
                handlers.insert(route.host.clone(), handler);
            }
        }

        Self {
            table,
            mode: Mode::ByHost { handlers, wildcard },
        }
    }

    /// Send every request to `target`, ignoring the Host header.
    pub fn target_only(target: &str, client: Arc<dyn HttpClient>) -> Result<Self, ConfigError> {
        let table = RoutingTable::build([(WILDCARD_HOST, target)])?;
        let backend_origin: Url = parse_backend_url(WILDCARD_HOST, target)?;
        let handler = ForwardHandler::new(
            BackendRoute {
                host: WILDCARD_HOST.to_string(),
                backend_origin,
            },
            client,
        );
        Ok(Self {
            table,
            mode: Mode::TargetOnly(handler),
        })
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// The route a request for `request_host` would be forwarded to.
    pub fn select(&self, request_host: &str) -> Option<&BackendRoute> {
        self.handler_for(request_host).map(ForwardHandler::route)
    }

    /// The handler bound to `request_host`, or the wildcard handler.
    ///
    /// `None` means no backend is responsible and the caller answers 404.
    pub fn handler_for(&self, request_host: &str) -> Option<&ForwardHandler> {
        match &self.mode {
            Mode::TargetOnly(handler) => Some(handler),
            Mode::ByHost { handlers, wildcard } => {
                let host = normalize_host(request_host);
                handlers.get(host.as_str()).or(wildcard.as_ref())
            }
        }
    }
}

/// Lowercase the host and drop an optional `:port`, keeping IPv6 brackets.
pub fn normalize_host(request_host: &str) -> String {
    let host = request_host.trim();
    let without_port = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    without_port.to_ascii_lowercase()
}
