//! Host-to-backend routing table.
//!
//! Built once at startup from validated `(host, backend_url)` pairs and never
//! mutated afterwards, so request tasks read it through an `Arc` without any
//! locking. Host keys are stored lowercase; an optional `*` entry catches every
//! host not listed explicitly.
use std::{cmp::Ordering, collections::HashMap};

use url::Url;

use crate::config::{ConfigError, WILDCARD_HOST};

/// A virtual host and the origin its requests are forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRoute {
    pub host: String,
    pub backend_origin: Url,
}

impl BackendRoute {
    pub fn is_wildcard(&self) -> bool {
        self.host == WILDCARD_HOST
    }
}

/// Immutable mapping from virtual host to [`BackendRoute`].
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<String, BackendRoute>,
}

impl RoutingTable {
    /// Build the table, parsing every backend URL.
    ///
    /// A later entry for the same host replaces the earlier one.
    pub fn build<I, H, U>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (H, U)>,
        H: AsRef<str>,
        U: AsRef<str>,
    {
        let mut routes = HashMap::new();

        for (host, backend_url) in entries {
            let host = host.as_ref().to_ascii_lowercase();
            let backend_origin = parse_backend_url(&host, backend_url.as_ref())?;

            let route = BackendRoute {
                host: host.clone(),
                backend_origin,
            };
            if let Some(previous) = routes.insert(host, route) {
                tracing::warn!(
                    host = %previous.host,
                    replaced = %previous.backend_origin,
                    "Duplicate host in configuration, the later entry wins"
                );
            }
        }

        Ok(Self { routes })
    }

    /// Exact lookup by (already normalized) host key.
    pub fn get(&self, host: &str) -> Option<&BackendRoute> {
        self.routes.get(host)
    }

    /// The catch-all route, if configured.
    pub fn wildcard(&self) -> Option<&BackendRoute> {
        self.routes.get(WILDCARD_HOST)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Every route, in no particular order.
    pub fn routes(&self) -> impl Iterator<Item = &BackendRoute> {
        self.routes.values()
    }

    /// Routes for display: literal hosts in byte order, wildcard last.
    ///
    /// The returned iterator is lazy and `Clone`, so it can be walked more
    /// than once (e.g. once to measure column width, once to print).
    pub fn ordered_view(&self) -> OrderedView<'_> {
        let mut hosts: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        hosts.sort_by(|a, b| match (*a == WILDCARD_HOST, *b == WILDCARD_HOST) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => a.cmp(b),
        });
        OrderedView {
            table: self,
            hosts,
            next: 0,
        }
    }
}

/// Sorted, restartable walk over a [`RoutingTable`].
#[derive(Debug, Clone)]
pub struct OrderedView<'a> {
    table: &'a RoutingTable,
    hosts: Vec<&'a str>,
    next: usize,
}

impl<'a> Iterator for OrderedView<'a> {
    type Item = (&'a str, &'a Url);

    fn next(&mut self) -> Option<Self::Item> {
        let host = *self.hosts.get(self.next)?;
        self.next += 1;
        let route = self.table.routes.get(host)?;
        Some((host, &route.backend_origin))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.hosts.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for OrderedView<'_> {}

/// Parse a backend URL, requiring an absolute http(s) URL with a host.
pub fn parse_backend_url(host: &str, raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidBackendUrl {
        host: host.to_string(),
        url: raw.to_string(),
        reason,
    };

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!(
            "unsupported scheme '{}', expected http or https",
            url.scheme()
        )));
    }
    if !url.has_host() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}
