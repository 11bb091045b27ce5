//! `devserver` command-line launcher.
//!
//! Serves a small demo app so the server, the reloader and TLS can be tried
//! (and integration-tested) without writing an app first:
//!
//! ```text
//! /          greeting text (from --greeting-file, read at startup)
//! /_getpid   id of the serving process
//! /echo      JSON view of the request
//! /stream    chunked output without Content-Length
//! /fail      application error (500 page)
//! /shutdown  asks the server to stop
//! ```

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde_json::json;

use devserver::config::{load_config, ConcurrencyMode, DevServerConfig, TlsSource};
use devserver::observability::logging;
use devserver::{app_fn, App, AppError, Body, Request, Responder, Start};

const DEFAULT_GREETING: &str = "Hello from devserver!";

#[derive(Parser, Debug)]
#[command(name = "devserver")]
#[command(about = "Development HTTP server with automatic reloading", long_about = None)]
struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// sequential, threaded or forked
    #[arg(long)]
    mode: Option<ConcurrencyMode>,

    /// Restart the server when watched files change
    #[arg(long)]
    reload: bool,

    #[arg(long)]
    reload_interval_ms: Option<u64>,

    /// Extra file or directory to watch (repeatable)
    #[arg(long = "extra-file")]
    extra_files: Vec<PathBuf>,

    /// Show failure details on error pages
    #[arg(long)]
    debug: bool,

    /// Serve HTTPS with a throwaway self-signed certificate
    #[arg(long, conflicts_with_all = ["cert_file", "key_file"])]
    adhoc_cert: bool,

    #[arg(long, requires = "key_file")]
    cert_file: Option<PathBuf>,

    #[arg(long, requires = "cert_file")]
    key_file: Option<PathBuf>,

    /// File whose contents `/` returns
    #[arg(long)]
    greeting_file: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<DevServerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => DevServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(mode) = self.mode {
            config.server.concurrency = mode;
        }
        if self.debug {
            config.server.debug = true;
        }
        if self.adhoc_cert {
            config.server.tls = TlsSource::Adhoc { common_name: None };
        }
        if let (Some(cert_path), Some(key_path)) = (self.cert_file, self.key_file) {
            config.server.tls = TlsSource::Files {
                cert_path,
                key_path,
            };
        }

        if self.reload {
            config.reloader.enabled = true;
        }
        if let Some(interval) = self.reload_interval_ms {
            config.reloader.interval_ms = interval;
        }
        config.reloader.extra_files.extend(self.extra_files);
        // Both feed the served app, so a change must restart the worker.
        config.reloader.extra_files.extend(self.config);
        config.reloader.extra_files.extend(self.greeting_file);

        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let greeting = match &cli.greeting_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => DEFAULT_GREETING.to_string(),
    };
    let config = cli.into_config()?;

    logging::init(&config.observability).context("failed to install log subscriber")?;
    tracing::debug!(config = ?config, "Configuration loaded");

    let code = devserver::run(demo_app(greeting), &config)?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn demo_app(greeting: String) -> impl App {
    app_fn(move |req, res| match req.path() {
        "/" => text(res, 200, greeting.clone()),
        "/_getpid" => text(res, 200, std::process::id().to_string()),
        "/echo" => echo(req, res),
        "/stream" => {
            res.start(Start::ok(
                200,
                vec![("Content-Type".into(), "text/plain; charset=utf-8".into())],
            ))?;
            Ok(Body::from_chunks(["one\n", "two\n", "three\n"]))
        }
        "/fail" => Err(anyhow::anyhow!("the demo app failed on purpose").into()),
        "/shutdown" => {
            req.shutdown_server();
            text(res, 200, "Shutting down\n".to_string())
        }
        _ => text(res, 404, "Not Found\n".to_string()),
    })
}

fn text(res: &mut Responder<'_>, status: u16, body: String) -> Result<Body, AppError> {
    res.start(Start::ok(
        status,
        vec![
            ("Content-Type".into(), "text/plain; charset=utf-8".into()),
            ("Content-Length".into(), body.len().to_string()),
        ],
    ))?;
    Ok(Body::from(body))
}

fn echo(req: &mut Request<'_>, res: &mut Responder<'_>) -> Result<Body, AppError> {
    let mut body = Vec::new();
    req.body().read_to_end(&mut body)?;
    let payload = json!({
        "environ": req.environ(),
        "body": String::from_utf8_lossy(&body),
        "multithread": req.is_multithread(),
        "multiprocess": req.is_multiprocess(),
    });
    let payload = serde_json::to_vec(&payload).map_err(anyhow::Error::from)?;
    res.start(Start::ok(
        200,
        vec![
            ("Content-Type".into(), "application/json".into()),
            ("Content-Length".into(), payload.len().to_string()),
        ],
    ))?;
    Ok(Body::from(payload))
}
