//! Response instrumentation.
//!
//! [`InstrumentedSink`] decorates any [`ResponseSink`], intercepting only body
//! writes and header commits to record the final status code and the number
//! of body bytes delivered. Every other capability (flush, hijack, deadlines,
//! full duplex) is forwarded unchanged so streaming and upgraded connections
//! behave exactly as they would without the wrapper.
use async_trait::async_trait;
use bytes::Bytes;
use hyper::{HeaderMap, StatusCode};
use tokio::time::Instant;

use crate::ports::response_sink::{Hijacked, ResponseSink, SinkResult};

/// Per-request accounting, owned by a single request's sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightResponseState {
    /// Status of the first header commit; `200 OK` until one happens.
    pub status: StatusCode,
    /// Sum of body bytes successfully handed to the client connection.
    pub bytes_written: u64,
    pub header_committed: bool,
    /// Once set, accounting stops; counts are not meaningful afterwards.
    pub hijacked: bool,
}

impl Default for InFlightResponseState {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            bytes_written: 0,
            header_committed: false,
            hijacked: false,
        }
    }
}

/// Decorator recording status and byte count of the wrapped sink.
#[derive(Debug)]
pub struct InstrumentedSink<S> {
    inner: S,
    state: InFlightResponseState,
}

impl<S: ResponseSink> InstrumentedSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: InFlightResponseState::default(),
        }
    }

    /// Snapshot of what has been observed so far.
    pub fn state(&self) -> InFlightResponseState {
        self.state
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_parts(self) -> (S, InFlightResponseState) {
        (self.inner, self.state)
    }

    async fn ensure_committed(&mut self) -> SinkResult<()> {
        if self.state.header_committed {
            return Ok(());
        }
        self.commit_header(StatusCode::OK).await
    }
}

#[async_trait]
impl<S: ResponseSink> ResponseSink for InstrumentedSink<S> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    async fn commit_header(&mut self, status: StatusCode) -> SinkResult<()> {
        if !self.state.header_committed && !self.state.hijacked {
            self.state.status = status;
            self.state.header_committed = true;
        }
        self.inner.commit_header(status).await
    }

    async fn write(&mut self, chunk: Bytes) -> SinkResult<usize> {
        if self.state.hijacked {
            return self.inner.write(chunk).await;
        }
        self.ensure_committed().await?;
        let n = self.inner.write(chunk).await?;
        self.state.bytes_written += n as u64;
        Ok(n)
    }

    async fn flush(&mut self) -> SinkResult<()> {
        if !self.state.hijacked {
            self.ensure_committed().await?;
        }
        self.inner.flush().await
    }

    fn hijack(&mut self) -> SinkResult<Hijacked> {
        let hijacked = self.inner.hijack()?;
        self.state.hijacked = true;
        Ok(hijacked)
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> SinkResult<()> {
        self.inner.set_read_deadline(deadline)
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> SinkResult<()> {
        self.inner.set_write_deadline(deadline)
    }

    fn enable_full_duplex(&mut self) -> SinkResult<()> {
        self.inner.enable_full_duplex()
    }

    fn abort(&mut self) {
        self.inner.abort();
    }

    async fn finish(&mut self) -> SinkResult<()> {
        if !self.state.hijacked {
            self.ensure_committed().await?;
        }
        self.inner.finish().await
    }
}
