//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! development server. All types derive Serde traits for deserialization
//! from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the development server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DevServerConfig {
    /// Listening socket, concurrency and TLS settings for the worker.
    pub server: ServerConfig,

    /// Source watching and worker respawn settings.
    pub reloader: ReloaderConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

/// Server configuration. Immutable once the server starts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (IPv4/IPv6 literal, host name, or `*` for all interfaces).
    pub host: String,

    /// Port to bind.
    pub port: u16,

    /// How accepted connections are dispatched.
    pub concurrency: ConcurrencyMode,

    /// Where the TLS identity comes from, if any.
    pub tls: TlsSource,

    /// Wrap the app with the debugging error page instead of the generic one.
    pub debug: bool,

    /// How long in-flight connections may run after shutdown, in milliseconds.
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            concurrency: ConcurrencyMode::default(),
            tls: TlsSource::default(),
            debug: false,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// URL scheme clients should use.
    pub fn scheme(&self) -> &'static str {
        if self.tls.is_enabled() {
            "https"
        } else {
            "http"
        }
    }

    /// Host as shown in the startup banner.
    pub fn display_host(&self) -> String {
        let host = match self.host.as_str() {
            "" | "*" => "localhost",
            other => other,
        };
        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        }
    }
}

/// Connection dispatch strategy, chosen at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    /// One connection at a time.
    Sequential,
    /// One OS thread per connection.
    #[default]
    Threaded,
    /// One child process per connection (unix only).
    Forked,
}

impl ConcurrencyMode {
    pub fn is_multithread(self) -> bool {
        matches!(self, ConcurrencyMode::Threaded)
    }

    pub fn is_multiprocess(self) -> bool {
        matches!(self, ConcurrencyMode::Forked)
    }
}

impl std::str::FromStr for ConcurrencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(ConcurrencyMode::Sequential),
            "threaded" => Ok(ConcurrencyMode::Threaded),
            "forked" => Ok(ConcurrencyMode::Forked),
            other => Err(format!(
                "unknown concurrency mode '{}' (expected sequential, threaded or forked)",
                other
            )),
        }
    }
}

/// Source of the TLS identity for the listening socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum TlsSource {
    /// Plain HTTP.
    #[default]
    None,
    /// Generate a throwaway self-signed certificate at startup.
    Adhoc {
        /// Common name for the certificate; `*` when unset.
        #[serde(default)]
        common_name: Option<String>,
    },
    /// Load an existing certificate and private key (PEM).
    Files {
        cert_path: PathBuf,
        key_path: PathBuf,
    },
}

impl TlsSource {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, TlsSource::None)
    }
}

/// Reloader configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReloaderConfig {
    /// Run the worker under the reloading supervisor.
    pub enabled: bool,

    /// Poll interval in milliseconds.
    pub interval_ms: u64,

    /// How long a worker may take to exit after SIGTERM before it is killed.
    pub grace_period_ms: u64,

    /// Additional files or directories to watch.
    pub extra_files: Vec<PathBuf>,

    /// File or directory names skipped while walking watched directories.
    pub ignore: Vec<String>,

    /// Watch the running executable itself (a rebuild restarts the worker).
    pub watch_executable: bool,
}

impl Default for ReloaderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 1_000,
            grace_period_ms: 5_000,
            extra_files: Vec::new(),
            ignore: vec![".git".to_string(), "target".to_string()],
            watch_executable: true,
        }
    }
}

impl ReloaderConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default `tracing` filter when `RUST_LOG` is not set.
    pub log_filter: String,

    /// Output format of the log layer.
    pub log_format: LogFormat,

    /// Address of the Prometheus scrape endpoint, if any.
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "devserver=info".to_string(),
            log_format: LogFormat::default(),
            metrics_address: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_local_plain_http() {
        let config = DevServerConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.tls, TlsSource::None);
        assert_eq!(config.server.scheme(), "http");
        assert!(!config.reloader.enabled);
        assert_eq!(config.reloader.interval(), Duration::from_secs(1));
    }

    #[test]
    fn tls_source_is_internally_tagged() {
        let server: ServerConfig = toml::from_str(
            r#"
            port = 8443
            [tls]
            source = "adhoc"
            common_name = "localhost"
            "#,
        )
        .unwrap();
        assert_eq!(
            server.tls,
            TlsSource::Adhoc {
                common_name: Some("localhost".into())
            }
        );
        assert_eq!(server.scheme(), "https");
    }

    #[test]
    fn ipv6_hosts_are_bracketed_for_display() {
        let mut server = ServerConfig::default();
        server.host = "::1".into();
        assert_eq!(server.display_host(), "[::1]");
        server.host = "*".into();
        assert_eq!(server.display_host(), "localhost");
    }

    #[test]
    fn concurrency_mode_parses_case_insensitively() {
        assert_eq!("Forked".parse::<ConcurrencyMode>(), Ok(ConcurrencyMode::Forked));
        assert!("pooled".parse::<ConcurrencyMode>().is_err());
    }
}
