use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::State,
    http::{HeaderValue, Method, StatusCode, header},
};
use bytes::Bytes;
use hyper::{Request, Response};
use tower_http::trace::TraceLayer;

use crate::{
    adapters::hyper_sink::HyperResponseSink,
    core::{
        dispatcher::Dispatcher,
        forward::{ClientConnection, ForwardError},
        instrumentation::InstrumentedSink,
    },
    ports::{
        access_log::{AccessLog, AccessLogEntry},
        response_sink::{ResponseSink, SinkResult},
    },
};

const NOT_FOUND_BODY: &str = "404 page not found\n";

/// HTTP entry point: picks a backend by Host and proxies the request.
///
/// Every request, routed or not, produces exactly one access-log entry once
/// its response has been fully handed to the client connection.
#[derive(Clone)]
pub struct ProxyHandler {
    dispatcher: Arc<Dispatcher>,
    access_log: Arc<dyn AccessLog>,
}

impl ProxyHandler {
    pub fn new(dispatcher: Arc<Dispatcher>, access_log: Arc<dyn AccessLog>) -> Self {
        Self {
            dispatcher,
            access_log,
        }
    }

    /// Axum router sending every method and path through [`Self::handle`].
    pub fn router(self) -> Router {
        Router::new()
            .fallback(proxy)
            .with_state(self)
            .layer(TraceLayer::new_for_http())
    }

    /// Handle one request.
    ///
    /// The response is produced on its own task that owns the instrumented
    /// sink; this future only waits for the response head.
    pub async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        let started = Instant::now();
        let client_conn = req
            .extensions()
            .get::<ClientConnection>()
            .copied()
            .unwrap_or(ClientConnection {
                remote_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
                tls: false,
            });

        let host = request_host(&req);
        let mut entry = AccessLogEntry {
            status: StatusCode::OK,
            method: req.method().clone(),
            scheme: client_conn.scheme(),
            host: host.clone(),
            path: req.uri().path().to_string(),
            bytes: 0,
            duration: Default::default(),
        };

        let forward = self.dispatcher.handler_for(&host).cloned();
        let head_only = req.method() == Method::HEAD;
        let (sink, req, pending) = HyperResponseSink::for_request(req);
        let mut sink = InstrumentedSink::new(sink);
        let access_log = self.access_log.clone();

        tokio::spawn(async move {
            let outcome = match forward {
                Some(forward) => forward.forward(req, &client_conn, &mut sink).await,
                None => {
                    tracing::debug!(host = %entry.host, "No route for host");
                    not_found(&mut sink, head_only).await.map_err(ForwardError::from)
                }
            };
            match outcome {
                Ok(()) => {}
                Err(ForwardError::Sink(e)) => {
                    tracing::debug!(host = %entry.host, error = %e, "Client went away");
                }
                Err(e) => tracing::warn!(host = %entry.host, error = %e, "Forwarding failed"),
            }
            if let Err(e) = sink.finish().await {
                tracing::debug!(error = %e, "Failed to finish response");
            }

            let state = sink.state();
            entry.status = state.status;
            entry.bytes = state.bytes_written;
            entry.duration = started.elapsed();
            access_log.record(&entry);
        });

        match pending.response().await {
            Some(response) => response,
            None => Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(AxumBody::empty())
                .unwrap_or_else(|_| Response::new(AxumBody::empty())),
        }
    }
}

async fn proxy(State(handler): State<ProxyHandler>, req: Request<AxumBody>) -> Response<AxumBody> {
    handler.handle(req).await
}

/// Host the client asked for: the absolute-form or HTTP/2 authority, else
/// the `Host` header.
fn request_host<B>(req: &Request<B>) -> String {
    req.uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default()
}

/// Plain-text 404 for hosts without a route. A `HEAD` request gets the
/// head only.
async fn not_found<S: ResponseSink>(sink: &mut S, head_only: bool) -> SinkResult<()> {
    let headers = sink.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(NOT_FOUND_BODY.len()));
    sink.commit_header(StatusCode::NOT_FOUND).await?;
    if !head_only {
        sink.write(Bytes::from_static(NOT_FOUND_BODY.as_bytes())).await?;
    }
    Ok(())
}
