//! vmportal Common Library
//!
//! Shared configuration, error, secret and console types for the portal.

pub mod config;
pub mod console;
pub mod db;
pub mod error;
pub mod secret;

// Re-export commonly used types
pub use config::{
    AuditConfig, ConsoleConfig, PortalConfig, ProxmoxConfig, ServiceAccountConfig, SessionConfig,
};
pub use console::{ConsoleGrant, ConsoleKey, ConsoleSession, NodeName, VmId};
pub use db::Database;
pub use error::{Error, Result};
pub use secret::Secret;

/// vmportal version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".vmportal")
}

/// Default configuration file path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("portal.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
