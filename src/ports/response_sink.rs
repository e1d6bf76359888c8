use std::{fmt, future::Future, pin::Pin};

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{HeaderMap, StatusCode, upgrade::Upgraded};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::time::Instant;

/// Errors raised by a [`ResponseSink`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SinkError {
    /// The client went away (connection closed or the response future was dropped).
    #[error("client connection closed")]
    ClientGone,

    /// A read or write deadline elapsed before the operation completed.
    #[error("{0} deadline exceeded")]
    DeadlineExceeded(&'static str),

    /// The connection cannot be hijacked (no upgrade support, or already hijacked).
    #[error("connection cannot be hijacked: {0}")]
    HijackUnavailable(String),

    /// The body cannot be written (e.g. the response was hijacked or finished).
    #[error("response body is closed")]
    BodyClosed,

    /// The upgraded connection failed to materialize.
    #[error("upgrade failed: {0}")]
    Upgrade(#[from] hyper::Error),
}

/// Result type for sink operations
pub type SinkResult<T> = Result<T, SinkError>;

/// Raw transport access obtained through [`ResponseSink::hijack`].
///
/// The connection becomes available once the `101 Switching Protocols` head
/// has been delivered to the client.
pub struct Hijacked {
    upgrade: Pin<Box<dyn Future<Output = Result<Upgraded, hyper::Error>> + Send>>,
}

impl Hijacked {
    pub fn new(upgrade: impl Future<Output = Result<Upgraded, hyper::Error>> + Send + 'static) -> Self {
        Self {
            upgrade: Box::pin(upgrade),
        }
    }

    /// Wait for the client side of the upgrade and return the raw stream.
    pub async fn into_io(self) -> SinkResult<TokioIo<Upgraded>> {
        let upgraded = self.upgrade.await?;
        Ok(TokioIo::new(upgraded))
    }
}

impl fmt::Debug for Hijacked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hijacked").finish_non_exhaustive()
    }
}

/// ResponseSink defines the port (interface) a handler writes a response into.
///
/// It mirrors the full capability set of an HTTP response channel: header
/// staging and commit, body writes, flush, hijack for protocol upgrades,
/// deadline control and full-duplex mode. Decorators must forward every
/// capability they do not intercept.
#[async_trait]
pub trait ResponseSink: Send {
    /// Headers staged for the response head. Changes after the head was
    /// committed have no effect.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Send the response head with the given status.
    async fn commit_header(&mut self, status: StatusCode) -> SinkResult<()>;

    /// Write a chunk of the response body, committing `200 OK` first if needed.
    async fn write(&mut self, chunk: Bytes) -> SinkResult<usize>;

    /// Push everything written so far to the client.
    async fn flush(&mut self) -> SinkResult<()>;

    /// Take raw control of the client connection for a protocol upgrade.
    fn hijack(&mut self) -> SinkResult<Hijacked>;

    /// Bound reads of the inbound request body. `None` clears the deadline.
    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> SinkResult<()>;

    /// Bound body writes and flushes. `None` clears the deadline.
    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> SinkResult<()>;

    /// Allow reading the request body while the response is being written.
    fn enable_full_duplex(&mut self) -> SinkResult<()>;

    /// Cut the response short so the client observes an incomplete body.
    fn abort(&mut self);

    /// Complete the response, committing `200 OK` with an empty body if no
    /// head was sent.
    async fn finish(&mut self) -> SinkResult<()>;
}
