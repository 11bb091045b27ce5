//! TLS identity for the listening socket.
//!
//! # Data Flow
//! ```text
//! TlsSource::None   → plain HTTP
//! TlsSource::Adhoc  → adhoc.rs (generate, write temp files) → loader.rs
//! TlsSource::Files  → loader.rs
//!     → TlsIdentity (rustls ServerConfig, temp files kept alive)
//!     → accept() per connection (blocking handshake)
//! ```
//!
//! # Design Decisions
//! - Generation or load failure is fatal at startup; there is no fallback
//!   to plain HTTP
//! - Temp files belong to the identity and are removed when it drops

pub mod adhoc;
pub mod loader;

use std::io;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::{ServerConfig, ServerConnection, StreamOwned};
use thiserror::Error;

use crate::config::TlsSource;

pub use adhoc::{generate_adhoc_pair, AdhocCertificate, AdhocPair};
pub use loader::load_server_config;

/// Upper bound on how long a client may take to finish the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to generate ad-hoc certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("failed to write ad-hoc certificate: {0}")]
    TempFile(#[source] io::Error),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificate found in {}", .0.display())]
    NoCertificate(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Config(#[source] rustls::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),
}

/// The server's TLS configuration plus whatever must outlive it.
#[derive(Debug)]
pub struct TlsIdentity {
    config: Arc<ServerConfig>,
    adhoc: Option<AdhocCertificate>,
}

impl TlsIdentity {
    /// Build the identity for `source`; `None` means plain HTTP.
    pub fn resolve(source: &TlsSource) -> Result<Option<Self>, TlsError> {
        match source {
            TlsSource::None => Ok(None),
            TlsSource::Adhoc { common_name } => {
                let cert = AdhocCertificate::generate(common_name.as_deref())?;
                let config = load_server_config(cert.cert_path(), cert.key_path())?;
                tracing::warn!("Serving with an ad-hoc certificate; clients will not trust it");
                Ok(Some(Self {
                    config,
                    adhoc: Some(cert),
                }))
            }
            TlsSource::Files {
                cert_path,
                key_path,
            } => Ok(Some(Self {
                config: load_server_config(cert_path, key_path)?,
                adhoc: None,
            })),
        }
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }

    /// The generated certificate, for `TlsSource::Adhoc`.
    pub fn adhoc(&self) -> Option<&AdhocCertificate> {
        self.adhoc.as_ref()
    }
}

/// Complete a server-side handshake on a blocking socket.
pub fn accept(
    config: Arc<ServerConfig>,
    mut tcp: TcpStream,
) -> Result<StreamOwned<ServerConnection, TcpStream>, TlsError> {
    let mut conn = ServerConnection::new(config).map_err(TlsError::Config)?;

    tcp.set_read_timeout(Some(HANDSHAKE_TIMEOUT))
        .map_err(TlsError::Handshake)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut tcp).map_err(TlsError::Handshake)?;
    }
    tcp.set_read_timeout(None).map_err(TlsError::Handshake)?;

    Ok(StreamOwned::new(conn, tcp))
}
