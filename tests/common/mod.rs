//! Shared fixtures: real axum backends on ephemeral ports and a proxy
//! assembled from library parts, stopped through a oneshot trigger.
#![allow(dead_code)]

use std::{
    io,
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::Arc,
    time::Duration,
};

use axum::Router;
use hostgate::{
    AccessLogEntry, Dispatcher, HttpClientAdapter, MemoryAccessLog, ProxyHandler, RoutingTable,
    Server, ServerSettings, TlsMaterial, server::LifecycleError,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

pub fn pick_free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("free port")
}

/// Serve `app` on an ephemeral port.
pub async fn spawn_backend(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("backend server error: {e}");
        }
    });
    addr
}

pub struct TestProxy {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    pub access_log: Arc<MemoryAccessLog>,
    stop: Option<oneshot::Sender<()>>,
    run: Option<JoinHandle<Result<(), LifecycleError>>>,
}

impl TestProxy {
    pub async fn start(entries: &[(&str, String)]) -> Self {
        Self::start_with(entries, ServerSettings::new("127.0.0.1:0")).await
    }

    pub async fn start_with(entries: &[(&str, String)], settings: ServerSettings) -> Self {
        let table = RoutingTable::build(entries.iter().map(|(h, u)| (*h, u.as_str()))).unwrap();
        let client = Arc::new(HttpClientAdapter::new().unwrap());
        let access_log = Arc::new(MemoryAccessLog::new());
        let router = ProxyHandler::new(
            Arc::new(Dispatcher::new(table, client)),
            access_log.clone(),
        )
        .router();

        let server = Arc::new(Server::bind(settings, router).await.unwrap());
        let addr = server.local_addr();
        let (stop, stopped) = oneshot::channel::<()>();
        let run = tokio::spawn(
            server
                .clone()
                .run_until(async move { stopped.await.map_err(io::Error::other) }),
        );

        Self {
            server,
            addr,
            access_log,
            stop: Some(stop),
            run: Some(run),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Fire the shutdown trigger without waiting.
    pub fn trigger_shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Trigger shutdown and wait for the supervisor's result.
    pub async fn stop(mut self) -> Result<(), LifecycleError> {
        self.trigger_shutdown();
        self.join().await
    }

    pub async fn join(&mut self) -> Result<(), LifecycleError> {
        let run = self.run.take().expect("proxy already joined");
        run.await.expect("supervisor task panicked")
    }

    /// Access-log entries once at least `n` were recorded (or after ~2s).
    pub async fn wait_for_entries(&self, n: usize) -> Vec<AccessLogEntry> {
        for _ in 0..200 {
            let entries = self.access_log.entries();
            if entries.len() >= n {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.access_log.entries()
    }
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Self-signed `localhost` certificate written to PEM files.
pub fn self_signed_tls() -> (TlsMaterial, tempfile::NamedTempFile, tempfile::NamedTempFile) {
    use std::io::Write;

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let mut cert_file = tempfile::NamedTempFile::with_suffix(".pem").unwrap();
    cert_file.write_all(cert.cert.pem().as_bytes()).unwrap();
    let mut key_file = tempfile::NamedTempFile::with_suffix(".pem").unwrap();
    key_file
        .write_all(cert.signing_key.serialize_pem().as_bytes())
        .unwrap();

    let material = TlsMaterial {
        cert_path: cert_file.path().to_path_buf(),
        key_path: key_file.path().to_path_buf(),
    };
    (material, cert_file, key_file)
}
