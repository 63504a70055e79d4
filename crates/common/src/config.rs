//! Portal configuration

use crate::{Error, Result, Secret};
use serde::{Deserialize, Serialize, Serializer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

/// Portal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// HTTP listen address
    pub listen: SocketAddr,

    /// Proxmox API configuration
    pub proxmox: ProxmoxConfig,

    /// Console broker configuration
    pub console: ConsoleConfig,

    /// Visitor session configuration
    pub session: SessionConfig,

    /// Audit log configuration
    pub audit: AuditConfig,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            proxmox: ProxmoxConfig::default(),
            console: ConsoleConfig::default(),
            session: SessionConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

/// Proxmox API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxConfig {
    /// Base URL of the Proxmox API, e.g. `https://pve.example.com:8006`
    pub base_url: String,

    /// Verify the Proxmox TLS certificate
    pub verify_tls: bool,

    /// Timeout for API requests
    pub request_timeout_secs: u64,

    /// Timeout for establishing connections (API and VNC websocket)
    pub connect_timeout_secs: u64,

    /// Realm appended to usernames given without `@realm`
    pub default_realm: String,

    /// If non-empty, only these nodes may be targeted
    pub allowed_nodes: Vec<String>,

    /// Service account used as the last credential source
    pub service_account: Option<ServiceAccountConfig>,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            base_url: "https://127.0.0.1:8006".to_string(),
            verify_tls: true,
            request_timeout_secs: 10,
            connect_timeout_secs: 5,
            default_realm: "pam".to_string(),
            allowed_nodes: Vec::new(),
            service_account: None,
        }
    }
}

/// Service-account credentials.
///
/// Only consulted for console tickets when `allow_console_fallback` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccountConfig {
    pub username: String,
    #[serde(serialize_with = "serialize_masked")]
    pub password: Secret,
    #[serde(default)]
    pub allow_console_fallback: bool,
}

/// Console broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// How long a pending console session may wait to be consumed
    pub ticket_ttl_secs: u64,

    /// Grace period for the websocket close handshake on teardown
    pub close_grace_millis: u64,

    /// Portal path of the websocket relay
    pub relay_path: String,

    /// Portal path prefix for vendored noVNC assets
    pub asset_root: String,

    /// Directory holding the vendored noVNC assets
    pub novnc_dir: Option<PathBuf>,

    /// Base delay for the single jittered retry of an unavailable upstream
    pub retry_backoff_millis: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            ticket_ttl_secs: 30,
            close_grace_millis: 500,
            relay_path: "/console/ws".to_string(),
            asset_root: "/novnc".to_string(),
            novnc_dir: None,
            retry_backoff_millis: 250,
        }
    }
}

/// Visitor session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the session cookie
    pub cookie_name: String,

    /// Session lifetime
    pub ttl_secs: u64,

    /// Mark the cookie `Secure`
    pub secure_cookie: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "vmportal_session".to_string(),
            ttl_secs: 60 * 60 * 12,
            secure_cookie: false,
        }
    }
}

/// Audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// SQLite database file for audit records
    pub db_path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            db_path: crate::default_store_path().join("audit.db"),
        }
    }
}

fn serialize_masked<S: Serializer>(secret: &Secret, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&secret.masked())
}

impl PortalConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML (secrets masked)
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let base = self.proxmox.base_url()?;
        if base.host_str().is_none() {
            return Err(Error::InvalidConfig("proxmox.base_url has no host".into()));
        }
        if self.console.ticket_ttl_secs == 0 {
            return Err(Error::InvalidConfig("console.ticket_ttl_secs must be > 0".into()));
        }
        for (name, path) in [
            ("console.relay_path", &self.console.relay_path),
            ("console.asset_root", &self.console.asset_root),
        ] {
            if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
                return Err(Error::InvalidConfig(format!(
                    "{} must start with '/' and not end with '/'",
                    name
                )));
            }
        }
        if let Some(sa) = &self.proxmox.service_account {
            if sa.username.trim().is_empty() || sa.password.is_empty() {
                return Err(Error::InvalidConfig(
                    "proxmox.service_account needs username and password".into(),
                ));
            }
        }
        Ok(())
    }
}

impl ProxmoxConfig {
    /// Parsed base URL (http or https only)
    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| Error::InvalidConfig(format!("proxmox.base_url: {}", e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(Error::InvalidConfig(format!(
                "proxmox.base_url scheme must be http or https, got {}",
                other
            ))),
        }
    }

    /// Whether a node passes the optional allowlist
    pub fn node_allowed(&self, node: &str) -> bool {
        self.allowed_nodes.is_empty() || self.allowed_nodes.iter().any(|n| n == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        PortalConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PortalConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.console.ticket_ttl_secs, 30);
        assert_eq!(cfg.console.relay_path, "/console/ws");
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portal.toml");
        std::fs::write(
            &path,
            r#"
listen = "0.0.0.0:9000"

[proxmox]
base_url = "https://pve.example.com:8006"
verify_tls = false
allowed_nodes = ["pve1", "pve2"]

[proxmox.service_account]
username = "portal@pve"
password = "hunter2"
allow_console_fallback = true

[console]
ticket_ttl_secs = 15
"#,
        )
        .unwrap();

        let cfg = PortalConfig::load(&path).unwrap();
        assert_eq!(cfg.listen.port(), 9000);
        assert!(!cfg.proxmox.verify_tls);
        assert!(cfg.proxmox.node_allowed("pve2"));
        assert!(!cfg.proxmox.node_allowed("pve3"));
        assert_eq!(cfg.console.ticket_ttl_secs, 15);
        assert_eq!(cfg.console.close_grace_millis, 500);
        let sa = cfg.proxmox.service_account.unwrap();
        assert!(sa.allow_console_fallback);
        assert_eq!(sa.password.expose(), "hunter2");
    }

    #[test]
    fn test_rejects_bad_scheme() {
        let mut cfg = PortalConfig::default();
        cfg.proxmox.base_url = "ftp://pve".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_trailing_slash_paths() {
        let mut cfg = PortalConfig::default();
        cfg.console.relay_path = "/console/ws/".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_to_toml_masks_service_password() {
        let mut cfg = PortalConfig::default();
        cfg.proxmox.service_account = Some(ServiceAccountConfig {
            username: "portal@pve".into(),
            password: Secret::new("supersecretpassword"),
            allow_console_fallback: false,
        });
        let rendered = cfg.to_toml().unwrap();
        assert!(!rendered.contains("supersecretpassword"));
    }
}
