//! Per-host request forwarding.
//!
//! A [`ForwardHandler`] rewrites an inbound request so that it targets its
//! backend origin, sends it through the [`HttpClient`] port and streams the
//! backend response into a [`ResponseSink`] frame by frame. Protocol upgrades
//! (`101 Switching Protocols`) are relayed by hijacking the client connection
//! and copying bytes in both directions.
use std::{net::SocketAddr, sync::Arc};

use axum::body::Body as AxumBody;
use http_body_util::BodyExt;
use hyper::{
    HeaderMap, Request, Response, StatusCode, Uri,
    header::{self, HeaderName, HeaderValue},
};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use url::{Position, Url};

use crate::{
    core::routing::BackendRoute,
    ports::{
        http_client::{HttpClient, HttpClientError},
        response_sink::{ResponseSink, SinkError},
    },
};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Headers that apply to a single transport hop and are never forwarded.
const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    KEEP_ALIVE,
    PROXY_CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Per-request errors. None of them is fatal to the process.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ForwardError {
    #[error("backend {backend} unreachable: {source}")]
    BackendUnreachable {
        backend: String,
        #[source]
        source: HttpClientError,
    },

    #[error("backend {backend} failed mid-stream: {message}")]
    BackendStreamFailure { backend: String, message: String },

    #[error("cannot build backend request: {0}")]
    InvalidTarget(String),

    #[error("protocol upgrade failed: {0}")]
    Upgrade(String),

    #[error("client side failed: {0}")]
    Sink(#[from] SinkError),
}

/// The client end of an accepted connection, attached to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConnection {
    pub remote_addr: SocketAddr,
    /// TLS was terminated by this proxy.
    pub tls: bool,
}

impl ClientConnection {
    pub fn scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }
}

/// Forwards requests for one virtual host to its backend origin.
#[derive(Clone)]
pub struct ForwardHandler {
    route: BackendRoute,
    client: Arc<dyn HttpClient>,
}

impl std::fmt::Debug for ForwardHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardHandler")
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

impl ForwardHandler {
    pub fn new(route: BackendRoute, client: Arc<dyn HttpClient>) -> Self {
        Self { route, client }
    }

    pub fn route(&self) -> &BackendRoute {
        &self.route
    }

    /// Proxy `req` to the backend and stream the answer into `sink`.
    ///
    /// When no response head can be obtained from the backend the sink gets a
    /// `502 Bad Gateway`. Nothing is retried.
    pub async fn forward<S>(
        &self,
        req: Request<AxumBody>,
        client_conn: &ClientConnection,
        sink: &mut S,
    ) -> Result<(), ForwardError>
    where
        S: ResponseSink,
    {
        let origin = &self.route.backend_origin;
        let backend = origin.as_str().to_string();

        let outbound = match self.rewrite(req, client_conn) {
            Ok(outbound) => outbound,
            Err(e) => {
                sink.commit_header(StatusCode::BAD_GATEWAY).await?;
                return Err(e);
            }
        };
        let requested_upgrade = upgrade_type(outbound.headers()).cloned();

        tracing::debug!(
            backend = %backend,
            method = %outbound.method(),
            uri = %outbound.uri(),
            "Forwarding request"
        );

        let response = match self.client.send_request(outbound).await {
            Ok(response) => response,
            Err(source) => {
                tracing::warn!(backend = %backend, error = %source, "Backend request failed");
                sink.commit_header(StatusCode::BAD_GATEWAY).await?;
                return Err(ForwardError::BackendUnreachable { backend, source });
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return relay_upgrade(response, requested_upgrade, sink).await;
        }

        let (mut parts, mut body) = response.into_parts();
        remove_hop_by_hop(&mut parts.headers);
        let flush_each_chunk = is_streaming_response(&parts.headers);

        sink.headers_mut().extend(parts.headers);
        sink.commit_header(parts.status).await?;

        while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(backend = %backend, error = %e, "Backend body failed mid-stream");
                    sink.abort();
                    return Err(ForwardError::BackendStreamFailure {
                        backend,
                        message: e.to_string(),
                    });
                }
            };
            match frame.into_data() {
                Ok(data) if data.is_empty() => {}
                Ok(data) => {
                    sink.write(data).await?;
                    if flush_each_chunk {
                        sink.flush().await?;
                    }
                }
                Err(_trailers) => tracing::debug!(backend = %backend, "Dropping response trailers"),
            }
        }

        Ok(())
    }

    /// Turn the inbound request into the outbound one.
    fn rewrite(
        &self,
        req: Request<AxumBody>,
        client_conn: &ClientConnection,
    ) -> Result<Request<AxumBody>, ForwardError> {
        let (mut parts, body) = req.into_parts();

        let original_host = parts
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string)
            });

        parts.uri = build_target_uri(&self.route.backend_origin, &parts.uri)?;

        let upgrade = upgrade_type(&parts.headers).cloned();
        let keep_te_trailers = parts
            .headers
            .get_all(header::TE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("trailers"));

        let headers = &mut parts.headers;
        remove_hop_by_hop(headers);
        headers.remove(header::HOST);
        if let Some(upgrade) = upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, upgrade);
        }
        if keep_te_trailers {
            headers.insert(header::TE, HeaderValue::from_static("trailers"));
        }
        set_forwarded_headers(headers, client_conn, original_host.as_deref());

        Ok(Request::from_parts(parts, body))
    }
}

/// Replace scheme and authority of `inbound` with the backend's, joining the
/// backend path prefix and the inbound path with exactly one slash.
pub fn build_target_uri(origin: &Url, inbound: &Uri) -> Result<Uri, ForwardError> {
    let authority = &origin[Position::BeforeHost..Position::AfterPort];
    let path = join_paths(origin.path(), inbound.path());

    let query = match (origin.query().filter(|q| !q.is_empty()), inbound.query()) {
        (Some(base), Some(extra)) if !extra.is_empty() => Some(format!("{base}&{extra}")),
        (Some(base), _) => Some(base.to_string()),
        (None, extra) => extra.map(str::to_string),
    };

    let mut target = format!("{}://{}{}", origin.scheme(), authority, path);
    if let Some(query) = query {
        target.push('?');
        target.push_str(&query);
    }

    target
        .parse()
        .map_err(|e| ForwardError::InvalidTarget(format!("{target}: {e}")))
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

fn set_forwarded_headers(
    headers: &mut HeaderMap,
    client_conn: &ClientConnection,
    original_host: Option<&str>,
) {
    let client_ip = client_conn.remote_addr.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let forwarded_for = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {client_ip}", prior.join(", "))
    };

    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    headers.remove(&X_FORWARDED_HOST);
    if let Some(value) = original_host.and_then(|h| HeaderValue::from_str(h).ok()) {
        headers.insert(X_FORWARDED_HOST, value);
    }

    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(client_conn.scheme()),
    );
}

/// Drop hop-by-hop headers, including any listed in `Connection`.
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// The requested protocol if `Connection` carries the `upgrade` token.
fn upgrade_type(headers: &HeaderMap) -> Option<&HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(header::UPGRADE)
    } else {
        None
    }
}

/// Event streams and responses of unknown length are flushed per chunk.
fn is_streaming_response(headers: &HeaderMap) -> bool {
    let event_stream = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    event_stream || !headers.contains_key(header::CONTENT_LENGTH)
}

async fn relay_upgrade<S: ResponseSink>(
    mut response: Response<AxumBody>,
    requested: Option<HeaderValue>,
    sink: &mut S,
) -> Result<(), ForwardError> {
    let accepted = upgrade_type(response.headers()).cloned();
    let protocols_match = match (&requested, &accepted) {
        (Some(req), Some(res)) => req
            .to_str()
            .ok()
            .zip(res.to_str().ok())
            .is_some_and(|(a, b)| a.eq_ignore_ascii_case(b)),
        _ => false,
    };
    if !protocols_match {
        sink.commit_header(StatusCode::BAD_GATEWAY).await?;
        return Err(ForwardError::Upgrade(format!(
            "backend switched to {accepted:?} when {requested:?} was requested"
        )));
    }

    let backend_upgrade = hyper::upgrade::on(&mut response);

    let (mut parts, _) = response.into_parts();
    remove_hop_by_hop(&mut parts.headers);
    if let Some(protocol) = accepted {
        parts
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        parts.headers.insert(header::UPGRADE, protocol);
    }

    sink.headers_mut().extend(parts.headers);
    sink.commit_header(StatusCode::SWITCHING_PROTOCOLS).await?;
    let client_side = sink.hijack()?;

    let (mut client_io, mut backend_io) = tokio::try_join!(
        async { client_side.into_io().await.map_err(|e| ForwardError::Upgrade(e.to_string())) },
        async {
            backend_upgrade
                .await
                .map(TokioIo::new)
                .map_err(|e| ForwardError::Upgrade(e.to_string()))
        },
    )?;

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((to_backend, to_client)) => {
            tracing::debug!(to_backend, to_client, "Upgraded connection closed");
        }
        Err(e) => tracing::debug!(error = %e, "Upgraded connection ended with error"),
    }
    Ok(())
}
