//! [`ResponseSink`] backed by a hyper server connection.
//!
//! The response head travels through a oneshot channel to the axum handler
//! that owns the request; the body is a bounded channel of frames exposed as
//! a streaming [`AxumBody`]. Backpressure from the client connection reaches
//! the writer through the channel capacity.
use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use bytes::Bytes;
use http_body_util::StreamBody;
use hyper::{
    HeaderMap, Request, Response, StatusCode,
    body::{Body, Frame, SizeHint},
    upgrade::OnUpgrade,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, Sleep},
};
use tokio_stream::wrappers::ReceiverStream;

use crate::ports::response_sink::{Hijacked, ResponseSink, SinkError, SinkResult};

type FrameResult = Result<Frame<Bytes>, io::Error>;

/// Receiving end of the response head, awaited by the request handler.
#[derive(Debug)]
pub struct PendingResponse(oneshot::Receiver<Response<AxumBody>>);

impl PendingResponse {
    /// `None` if the sink went away without committing a head.
    pub async fn response(self) -> Option<Response<AxumBody>> {
        self.0.await.ok()
    }
}

#[derive(Debug)]
pub struct HyperResponseSink {
    headers: HeaderMap,
    head_tx: Option<oneshot::Sender<Response<AxumBody>>>,
    body_tx: Option<mpsc::Sender<FrameResult>>,
    on_upgrade: Option<OnUpgrade>,
    write_deadline: Option<Instant>,
    read_deadline: watch::Sender<Option<Instant>>,
    full_duplex: bool,
}

impl HyperResponseSink {
    /// Create a sink for `req`.
    ///
    /// Returns the sink, the request with its body bound to the sink's read
    /// deadline, and the handle on which the response head arrives.
    pub fn for_request(mut req: Request<AxumBody>) -> (Self, Request<AxumBody>, PendingResponse) {
        let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();
        let (read_deadline, deadline_rx) = watch::channel(None);
        let req = req.map(|body| AxumBody::new(DeadlineBody::new(body, deadline_rx)));
        let (head_tx, head_rx) = oneshot::channel();

        let sink = Self {
            headers: HeaderMap::new(),
            head_tx: Some(head_tx),
            body_tx: None,
            on_upgrade,
            write_deadline: None,
            read_deadline,
            full_duplex: false,
        };
        (sink, req, PendingResponse(head_rx))
    }

    pub fn is_full_duplex(&self) -> bool {
        self.full_duplex
    }

    fn send_head(&mut self, status: StatusCode, body: AxumBody) -> SinkResult<()> {
        let Some(head_tx) = self.head_tx.take() else {
            tracing::warn!(%status, "Superfluous response header commit ignored");
            return Ok(());
        };
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        head_tx.send(response).map_err(|_| SinkError::ClientGone)
    }

    async fn ensure_committed(&mut self) -> SinkResult<()> {
        if self.head_tx.is_some() {
            self.commit_header(StatusCode::OK).await?;
        }
        Ok(())
    }

    fn body_sender(&self) -> SinkResult<mpsc::Sender<FrameResult>> {
        self.body_tx.clone().ok_or(SinkError::BodyClosed)
    }
}

/// Run `fut`, failing with `DeadlineExceeded` once `deadline` passes.
async fn bounded<F: Future>(
    deadline: Option<Instant>,
    what: &'static str,
    fut: F,
) -> SinkResult<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| SinkError::DeadlineExceeded(what)),
        None => Ok(fut.await),
    }
}

#[async_trait]
impl ResponseSink for HyperResponseSink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn commit_header(&mut self, status: StatusCode) -> SinkResult<()> {
        if self.head_tx.is_none() || status == StatusCode::SWITCHING_PROTOCOLS {
            return self.send_head(status, AxumBody::empty());
        }

        let (tx, rx) = mpsc::channel(1);
        self.send_head(status, AxumBody::new(StreamBody::new(ReceiverStream::new(rx))))?;
        self.body_tx = Some(tx);
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> SinkResult<usize> {
        self.ensure_committed().await?;
        let tx = self.body_sender()?;
        let n = chunk.len();
        bounded(self.write_deadline, "write", tx.send(Ok(Frame::data(chunk))))
            .await?
            .map_err(|_| SinkError::ClientGone)?;
        Ok(n)
    }

    async fn flush(&mut self) -> SinkResult<()> {
        self.ensure_committed().await?;
        let Some(tx) = self.body_tx.clone() else {
            return Ok(());
        };
        // A free slot means the connection has taken every queued frame.
        let permit = bounded(self.write_deadline, "write", tx.reserve())
            .await?
            .map_err(|_| SinkError::ClientGone)?;
        drop(permit);
        Ok(())
    }

    fn hijack(&mut self) -> SinkResult<Hijacked> {
        let on_upgrade = self.on_upgrade.take().ok_or_else(|| {
            SinkError::HijackUnavailable(
                "connection does not support upgrades or was already hijacked".to_string(),
            )
        })?;
        Ok(Hijacked::new(on_upgrade))
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> SinkResult<()> {
        self.read_deadline.send_replace(deadline);
        Ok(())
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> SinkResult<()> {
        self.write_deadline = deadline;
        Ok(())
    }

    fn enable_full_duplex(&mut self) -> SinkResult<()> {
        // hyper reads request bodies and writes responses concurrently already
        self.full_duplex = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.head_tx = None;
        if let Some(tx) = self.body_tx.take() {
            let err = io::Error::other("response aborted after backend failure");
            if let Err(mpsc::error::TrySendError::Full(frame)) = tx.try_send(Err(err)) {
                tokio::spawn(async move {
                    let _ = tx.send(frame).await;
                });
            }
        }
    }

    async fn finish(&mut self) -> SinkResult<()> {
        if self.head_tx.is_some() {
            self.send_head(StatusCode::OK, AxumBody::empty())?;
        }
        self.body_tx = None;
        Ok(())
    }
}

/// Request body whose reads fail once the sink's read deadline passes.
///
/// A deadline change is picked up on the next poll of the body.
pub struct DeadlineBody {
    inner: AxumBody,
    deadline: watch::Receiver<Option<Instant>>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl DeadlineBody {
    fn new(inner: AxumBody, deadline: watch::Receiver<Option<Instant>>) -> Self {
        Self {
            inner,
            deadline,
            sleep: None,
        }
    }
}

impl Body for DeadlineBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if this.deadline.has_changed().unwrap_or(false) {
            let deadline = *this.deadline.borrow_and_update();
            this.sleep = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
        }

        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame);
        }

        if let Some(sleep) = this.sleep.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                let err =
                    io::Error::new(io::ErrorKind::TimedOut, "request body read deadline exceeded");
                return Poll::Ready(Some(Err(axum::Error::new(err))));
            }
        }

        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
