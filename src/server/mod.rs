//! Listener lifecycle: bind, serve, drain, stop.
//!
//! A [`Server`] moves through [`Phase::Starting`], [`Phase::Serving`],
//! [`Phase::Draining`] and [`Phase::Stopped`] in that order. Every accepted
//! connection runs on its own task registered in a [`TaskTracker`], so a
//! drain can ask all of them to finish and wait, bounded by a grace period,
//! before force-closing whatever is left.
//!
//! [`Server::run_until`] supervises the accept loop and the shutdown trigger
//! as two tasks and folds their outcome into one result.
mod tls;

use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use axum::{Router, body::Body as AxumBody};
use hyper::{Request, body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower::ServiceExt;

pub use self::tls::TlsMaterial;
use crate::core::forward::ClientConnection;

pub const DEFAULT_LISTEN_ADDR: &str = ":8080";
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long force-closed connection tasks get to unwind.
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Serving,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// `host:port`; a bare `:port` listens on every interface.
    pub listen_addr: String,
    pub tls: Option<TlsMaterial>,
    pub drain_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            tls: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl ServerSettings {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_tls(mut self, tls: Option<TlsMaterial>) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BindError {
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ServeError {
    /// Shutdown closed the listener. Not a failure.
    #[error("listener closed by shutdown")]
    Closed,

    #[error("server is already serving")]
    AlreadyServing,

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ShutdownError {
    #[error("{remaining} connection(s) still open after {grace:?}, force-closed")]
    GracePeriodElapsed { grace: Duration, remaining: usize },
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LifecycleError {
    #[error(transparent)]
    Serve(#[from] ServeError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error("failed to wait for shutdown signal: {0}")]
    Signal(#[source] io::Error),

    #[error("lifecycle task panicked: {0}")]
    TaskPanicked(String),
}

/// Accepts connections and hands every request to an axum [`Router`].
pub struct Server {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    router: Router,
    drain_timeout: Duration,
    tracker: TaskTracker,
    /// Stop accepting, finish connections gracefully.
    closing: CancellationToken,
    /// Drop whatever connections are left.
    force: CancellationToken,
    phase: watch::Sender<Phase>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("tls", &self.tls.is_some())
            .field("phase", &*self.phase.borrow())
            .field("connections", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Bind the listener and load TLS material.
    pub async fn bind(settings: ServerSettings, router: Router) -> Result<Self, BindError> {
        let (phase, _) = watch::channel(Phase::Starting);

        let addr = normalize_listen_addr(&settings.listen_addr)?;
        let tls = settings
            .tls
            .as_ref()
            .map(TlsMaterial::load_acceptor)
            .transpose()?;

        let listener = TcpListener::bind(addr.as_str())
            .await
            .map_err(|source| BindError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| BindError::Bind {
            addr: addr.clone(),
            source,
        })?;

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            tls,
            router,
            drain_timeout: settings.drain_timeout,
            tracker: TaskTracker::new(),
            closing: CancellationToken::new(),
            force: CancellationToken::new(),
            phase,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Observe phase transitions.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Number of connections currently being served.
    pub fn open_connections(&self) -> usize {
        self.tracker.len()
    }

    /// Accept connections until [`Self::shutdown`] closes the listener.
    ///
    /// Returns [`ServeError::Closed`] after a shutdown; any other error is
    /// fatal.
    pub async fn serve(&self) -> Result<(), ServeError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ServeError::AlreadyServing)?;

        if self.closing.is_cancelled() {
            return Err(ServeError::Closed);
        }
        self.phase.send_replace(Phase::Serving);
        tracing::info!(addr = %self.local_addr, tls = self.is_tls(), "Listening");

        loop {
            let accepted = tokio::select! {
                _ = self.closing.cancelled() => {
                    tracing::debug!(addr = %self.local_addr, "Listener closed");
                    return Err(ServeError::Closed);
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote_addr)) => self.spawn_connection(stream, remote_addr),
                Err(e) if is_connection_error(&e) => {
                    tracing::debug!(error = %e, "Accepted connection failed");
                }
                Err(e) if is_resource_error(&e) => {
                    tracing::warn!(error = %e, "Accept failed, retrying in 1s");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(ServeError::Accept(e)),
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, remote_addr: SocketAddr) {
        let client = ClientConnection {
            remote_addr,
            tls: self.tls.is_some(),
        };
        let router = self.router.clone();
        let tls = self.tls.clone();
        let closing = self.closing.clone();
        let force = self.force.clone();

        self.tracker.spawn(async move {
            let Some(acceptor) = tls else {
                serve_connection(stream, client, router, closing, force).await;
                return;
            };

            let handshake = tokio::select! {
                res = acceptor.accept(stream) => res,
                _ = force.cancelled() => return,
            };
            match handshake {
                Ok(stream) => serve_connection(stream, client, router, closing, force).await,
                Err(e) => tracing::debug!(remote = %remote_addr, error = %e, "TLS handshake failed"),
            }
        });
    }

    /// Stop accepting, let open connections finish, and wait at most `grace`.
    ///
    /// Connections still open when the grace period ends are dropped and
    /// [`ShutdownError::GracePeriodElapsed`] is returned.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), ShutdownError> {
        self.phase.send_replace(Phase::Draining);
        self.closing.cancel();
        self.tracker.close();
        tracing::info!(
            connections = self.tracker.len(),
            grace = %humantime::format_duration(grace),
            "Draining connections"
        );

        let result = match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                tracing::info!("All connections drained");
                Ok(())
            }
            Err(_) => {
                let remaining = self.tracker.len();
                tracing::warn!(remaining, "Grace period elapsed, force-closing connections");
                self.force.cancel();
                let _ = tokio::time::timeout(FORCE_CLOSE_WAIT, self.tracker.wait()).await;
                Err(ShutdownError::GracePeriodElapsed { grace, remaining })
            }
        };

        self.phase.send_replace(Phase::Stopped);
        result
    }

    /// Serve until `signal` resolves, then drain with the configured timeout.
    ///
    /// The accept loop and the signal watcher run as two tasks sharing one
    /// cancellation token: if either fails the other is told to stop. The
    /// result is the first error that is not [`ServeError::Closed`].
    pub async fn run_until<F, T>(self: Arc<Self>, signal: F) -> Result<(), LifecycleError>
    where
        F: Future<Output = io::Result<T>> + Send + 'static,
        T: fmt::Debug + Send + 'static,
    {
        let stop = CancellationToken::new();
        let mut tasks: JoinSet<Result<(), LifecycleError>> = JoinSet::new();

        let server = self.clone();
        tasks.spawn(async move { server.serve().await.map_err(LifecycleError::from) });

        let server = self.clone();
        let watcher_stop = stop.clone();
        tasks.spawn(async move {
            let grace = server.drain_timeout;
            tokio::select! {
                res = signal => match res {
                    Ok(reason) => tracing::info!(?reason, "Shutdown requested"),
                    Err(e) => {
                        tracing::error!(error = %e, "Shutdown signal failed, stopping");
                        let _ = server.shutdown(grace).await;
                        return Err(LifecycleError::Signal(e));
                    }
                },
                _ = watcher_stop.cancelled() => {
                    tracing::debug!("Stopping after task failure");
                }
            }
            server.shutdown(grace).await.map_err(LifecycleError::from)
        });

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok(Ok(())) | Ok(Err(LifecycleError::Serve(ServeError::Closed))) => continue,
                Ok(Err(e)) => e,
                Err(e) => LifecycleError::TaskPanicked(e.to_string()),
            };
            stop.cancel();
            match first_error {
                None => first_error = Some(error),
                Some(_) => tracing::warn!(error = %error, "Additional lifecycle error"),
            }
        }

        self.phase.send_replace(Phase::Stopped);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Serve one connection with HTTP/1.1 (with upgrades) or HTTP/2.
async fn serve_connection<I>(
    io: I,
    client: ClientConnection,
    router: Router,
    closing: CancellationToken,
    force: CancellationToken,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(client);
        router.clone().oneshot(req.map(AxumBody::new))
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = closing.cancelled() => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                res = conn.as_mut() => res,
                _ = force.cancelled() => {
                    tracing::debug!(remote = %client.remote_addr, "Connection force-closed");
                    return;
                }
            }
        }
    };

    if let Err(e) = result {
        tracing::debug!(remote = %client.remote_addr, error = %e, "Connection ended with error");
    }
}

/// Expand `:port` to all interfaces and check that a port is present.
pub fn normalize_listen_addr(addr: &str) -> Result<String, BindError> {
    let addr = addr.trim();
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    let invalid = |reason: &str| BindError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };
    let (host, port) = full.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    port.parse::<u16>()
        .map_err(|_| invalid("port is not a number between 0 and 65535"))?;

    Ok(full)
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Out of file descriptors or buffers; worth retrying after a pause.
#[cfg(unix)]
fn is_resource_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_error(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::OutOfMemory
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_resource_errors_use_platform_errno() {
        for code in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            assert!(is_resource_error(&io::Error::from_raw_os_error(code)));
        }
        assert!(!is_resource_error(&io::Error::from_raw_os_error(
            libc::ECONNRESET
        )));
        assert!(!is_resource_error(&io::Error::other("not an os error")));
    }

    #[test]
    fn test_normalize_listen_addr() {
        assert_eq!(normalize_listen_addr(":8080").unwrap(), "0.0.0.0:8080");
        assert_eq!(
            normalize_listen_addr("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000"
        );
        assert_eq!(normalize_listen_addr("[::1]:443").unwrap(), "[::1]:443");
        assert_eq!(
            normalize_listen_addr("localhost:80").unwrap(),
            "localhost:80"
        );
    }

    #[test]
    fn test_invalid_listen_addr() {
        assert!(matches!(
            normalize_listen_addr("8080"),
            Err(BindError::InvalidAddress { .. })
        ));
        assert!(normalize_listen_addr(":http").is_err());
        assert!(normalize_listen_addr(":70000").is_err());
    }

    #[tokio::test]
    async fn test_bind_starts_in_starting_phase() {
        let server = Server::bind(ServerSettings::new("127.0.0.1:0"), Router::new())
            .await
            .unwrap();

        assert_ne!(server.local_addr().port(), 0);
        assert!(!server.is_tls());
        assert_eq!(*server.phase().borrow(), Phase::Starting);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let err = Server::bind(ServerSettings::new(addr), Router::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_serve_twice_is_rejected() {
        let server = Arc::new(
            Server::bind(ServerSettings::new("127.0.0.1:0"), Router::new())
                .await
                .unwrap(),
        );
        let first = tokio::spawn({
            let server = server.clone();
            async move { server.serve().await }
        });

        let mut phase = server.phase();
        phase.wait_for(|p| *p == Phase::Serving).await.unwrap();
        assert!(matches!(
            server.serve().await,
            Err(ServeError::AlreadyServing)
        ));

        server.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(first.await.unwrap(), Err(ServeError::Closed)));
        assert_eq!(*server.phase().borrow(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_run_until_clean_shutdown() {
        let server = Arc::new(
            Server::bind(ServerSettings::new("127.0.0.1:0"), Router::new())
                .await
                .unwrap(),
        );
        let result = server
            .clone()
            .run_until(async { Ok::<_, io::Error>("test") })
            .await;

        assert!(result.is_ok());
        assert_eq!(*server.phase().borrow(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_run_until_reports_signal_failure() {
        let server = Arc::new(
            Server::bind(ServerSettings::new("127.0.0.1:0"), Router::new())
                .await
                .unwrap(),
        );
        let result = server
            .run_until(async { Err::<(), _>(io::Error::other("no signals")) })
            .await;

        assert!(matches!(result, Err(LifecycleError::Signal(_))));
    }
}
