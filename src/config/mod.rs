//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) and CLI flags
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → DevServerConfig (validated, immutable)
//!     → handed to the launcher, then to the supervisor or the server
//! ```
//!
//! # Design Decisions
//! - Config is immutable once the server starts; changes need a restart,
//!   which the reloader does for free when the config file is watched
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::ConcurrencyMode;
pub use schema::DevServerConfig;
pub use schema::LogFormat;
pub use schema::ObservabilityConfig;
pub use schema::ReloaderConfig;
pub use schema::ServerConfig;
pub use schema::TlsSource;
