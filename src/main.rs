use std::{fmt::Write as _, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use unicode_width::UnicodeWidthStr;
use hostgate::{
    adapters::{HttpClientAdapter, ProxyHandler, StdoutAccessLog, TracingAccessLog},
    config::load_config,
    core::{Dispatcher, RoutingTable},
    ports::{AccessLog, HttpClient},
    server::{DEFAULT_LISTEN_ADDR, Server, ServerSettings, TlsMaterial},
    tracing_setup::{self, LogFormat},
    utils::wait_for_interrupt,
};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum AccessLogKind {
    /// Plain lines on stdout
    Stdout,
    /// Structured events through the diagnostic logger
    Tracing,
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Listen address; `:PORT` listens on every interface
    #[clap(long = "http", default_value = DEFAULT_LISTEN_ADDR)]
    listen_addr: String,

    /// TLS certificate chain (PEM), requires --key
    #[clap(long)]
    cert: Option<PathBuf>,

    /// TLS private key (PEM), requires --cert
    #[clap(long)]
    key: Option<PathBuf>,

    /// Host routing configuration file
    #[clap(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Forward every request to this URL and ignore the configuration file
    #[clap(long)]
    target: Option<String>,

    /// How long open connections may take to finish on shutdown
    #[clap(long, default_value = "5s", value_parser = humantime::parse_duration)]
    grace_period: Duration,

    #[clap(long, value_enum, default_value_t = LogFormat::Console)]
    log_format: LogFormat,

    #[clap(long, value_enum, default_value = "stdout")]
    access_log: AccessLogKind,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    tracing_setup::init_tracing(args.log_format)?;

    let tls = TlsMaterial::from_paths(args.cert.clone(), args.key.clone())?;
    let client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().wrap_err("Failed to create backend HTTP client")?);

    let dispatcher = match &args.target {
        Some(target) => Dispatcher::target_only(target, client)?,
        None => {
            let config = load_config(&args.config)?;
            Dispatcher::new(RoutingTable::build(config.entries())?, client)
        }
    };
    let banner = render_banner(&args.listen_addr, dispatcher.table());

    let access_log: Arc<dyn AccessLog> = match args.access_log {
        AccessLogKind::Stdout => Arc::new(StdoutAccessLog),
        AccessLogKind::Tracing => Arc::new(TracingAccessLog),
    };
    let router = ProxyHandler::new(Arc::new(dispatcher), access_log).router();

    let settings = ServerSettings::new(args.listen_addr.as_str())
        .with_tls(tls)
        .with_drain_timeout(args.grace_period);
    let server = Server::bind(settings, router)
        .await
        .wrap_err("Failed to start server")?;

    print!("{banner}");
    Arc::new(server).run_until(wait_for_interrupt()).await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Startup summary: one `host => backend` line per route, wildcard last.
fn render_banner(listen_addr: &str, table: &RoutingTable) -> String {
    let routes = table.ordered_view();
    let width = routes
        .clone()
        .map(|(host, _)| host.width())
        .max()
        .unwrap_or(0);

    let mut out = format!("Start server [{listen_addr}], and forwarded to:\n");
    for (host, url) in routes {
        let pad = width.saturating_sub(host.width());
        let _ = writeln!(out, "  {host}{:pad$} => {url}", "");
    }
    out.push('\n');
    out
}
