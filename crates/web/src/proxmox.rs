//! Proxmox VE API client
//!
//! Only the calls the console broker needs: password login (`access/ticket`),
//! `vncproxy`, and the noVNC console bootstrap page. Responses are decoded
//! into typed structures; a missing or mistyped required field is reported as
//! [`ProxmoxError::Malformed`].

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use reqwest::header;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use vmportal_common::{secret, ConsoleSession, NodeName, ProxmoxConfig, Secret, VmId};

/// Payload keys whose values are masked before a raw response is logged.
const SECRET_KEYS: &[&str] = &["ticket", "CSRFPreventionToken", "password", "vncticket", "cert"];

/// Largest slice of a non-JSON payload that is logged.
const MAX_LOGGED_PAYLOAD: usize = 512;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxmoxError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("unexpected status {0}")]
    Status(StatusCode),
}

/// Username/password pair for `access/ticket`.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: Secret) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

/// Result of a successful login: the PVEAuthCookie value and its CSRF token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxmoxAuth {
    pub username: String,
    pub cookie: Secret,
    pub csrf_token: Option<Secret>,
}

impl ProxmoxAuth {
    pub fn cookie_header(&self) -> String {
        format!("PVEAuthCookie={}", self.cookie.expose())
    }
}

/// Result of `vncproxy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VncProxyTicket {
    pub ticket: Secret,
    pub port: u16,
}

/// Raw console bootstrap response.
#[derive(Debug, Clone)]
pub struct BootstrapPage {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Where the Proxmox API lives, and the URLs derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxmoxEndpoint {
    base: Url,
}

impl ProxmoxEndpoint {
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    pub fn from_config(cfg: &ProxmoxConfig) -> vmportal_common::Result<Self> {
        Ok(Self::new(cfg.base_url()?))
    }

    pub fn scheme(&self) -> &str {
        self.base.scheme()
    }

    pub fn hostname(&self) -> &str {
        self.base.host_str().unwrap_or_default()
    }

    /// `host:port`, with the scheme's default port filled in.
    pub fn host_port(&self) -> String {
        match self.base.port_or_known_default() {
            Some(port) => format!("{}:{}", self.hostname(), port),
            None => self.hostname().to_string(),
        }
    }

    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme(), self.host_port())
    }

    pub fn api_url(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url.set_query(None);
        url
    }

    /// Relative websocket path as noVNC expects it in its `path` parameter.
    pub fn vnc_websocket_path(node: &NodeName, vmid: VmId) -> String {
        format!("api2/json/nodes/{}/qemu/{}/vncwebsocket", node, vmid)
    }

    /// Upstream VNC websocket URL: http maps to ws, https to wss.
    pub fn vnc_websocket_url(&self, node: &NodeName, vmid: VmId, port: u16, ticket: &Secret) -> Url {
        let ws_scheme = if self.scheme() == "https" { "wss" } else { "ws" };
        let mut url = self.base.clone();
        // http(s) and ws(s) are all special schemes, so this cannot fail.
        let _ = url.set_scheme(ws_scheme);
        url.set_path(&format!("/{}", Self::vnc_websocket_path(node, vmid)));
        url.set_query(None);
        url.query_pairs_mut()
            .append_pair("port", &port.to_string())
            .append_pair("vncticket", ticket.expose());
        url
    }

    /// noVNC console bootstrap page URL.
    pub fn bootstrap_url(&self, node: &NodeName, vmid: VmId, port: u16, ticket: &Secret) -> Url {
        let ws_query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("port", &port.to_string())
            .append_pair("vncticket", ticket.expose())
            .finish();
        let ws_path = format!("{}?{}", Self::vnc_websocket_path(node, vmid), ws_query);

        let mut url = self.api_url("/");
        url.query_pairs_mut()
            .append_pair("console", "kvm")
            .append_pair("novnc", "1")
            .append_pair("node", node.as_str())
            .append_pair("vmid", &vmid.to_string())
            .append_pair("resize", "off")
            .append_pair("path", &ws_path)
            .append_pair("vncticket", ticket.expose());
        url
    }
}

/// The Proxmox calls the console broker depends on.
#[async_trait]
pub trait ProxmoxApi: Send + Sync {
    fn endpoint(&self) -> &ProxmoxEndpoint;

    /// `POST /api2/json/access/ticket`
    async fn login(&self, credentials: &Credentials) -> Result<ProxmoxAuth, ProxmoxError>;

    /// `POST /api2/json/nodes/{node}/qemu/{vmid}/vncproxy`
    async fn vnc_proxy(
        &self,
        auth: &ProxmoxAuth,
        node: &NodeName,
        vmid: VmId,
    ) -> Result<VncProxyTicket, ProxmoxError>;

    /// Console bootstrap HTML. Any HTTP status is returned as a page; only
    /// transport failures are errors.
    async fn console_bootstrap(&self, session: &ConsoleSession) -> Result<BootstrapPage, ProxmoxError>;
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct AuthTicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_prevention_token: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VncProxyData {
    ticket: String,
    #[serde(deserialize_with = "deserialize_port")]
    port: u16,
}

#[derive(Serialize)]
struct AuthTicketForm<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct VncProxyParams {
    websocket: u8,
}

/// PVE has emitted `port` both as a JSON integer and as a numeric string.
fn deserialize_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u64),
        Str(String),
    }

    let raw = match Repr::deserialize(deserializer)? {
        Repr::Num(n) => n,
        Repr::Str(s) => s
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom("port is not numeric"))?,
    };
    match u16::try_from(raw) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(serde::de::Error::custom("port out of range")),
    }
}

/// Decode a `{"data": ...}` envelope, logging the (redacted) payload on failure.
pub(crate) fn parse_envelope<T: DeserializeOwned>(body: &str, what: &'static str) -> Result<T, ProxmoxError> {
    serde_json::from_str::<Envelope<T>>(body)
        .map(|env| env.data)
        .map_err(|e| {
            error!(
                call = what,
                error = %e,
                payload = %redact_payload(body),
                "Malformed Proxmox response"
            );
            ProxmoxError::Malformed(format!("{}: {}", what, e))
        })
}

/// Mask secret-bearing fields of a JSON payload; truncate anything else.
pub(crate) fn redact_payload(body: &str) -> String {
    fn walk(value: &mut serde_json::Value) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, v) in map.iter_mut() {
                    if SECRET_KEYS.contains(&key.as_str()) {
                        if let serde_json::Value::String(s) = v {
                            *s = secret::mask(s);
                        }
                    } else {
                        walk(v);
                    }
                }
            }
            serde_json::Value::Array(items) => items.iter_mut().for_each(walk),
            _ => {}
        }
    }

    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(mut value) => {
            walk(&mut value);
            value.to_string()
        }
        Err(_) => {
            let truncated: String = body.chars().take(MAX_LOGGED_PAYLOAD).collect();
            if truncated.len() < body.len() {
                format!("{}…(truncated, len={})", truncated, body.len())
            } else {
                truncated
            }
        }
    }
}

/// Map a non-success status to an error; `None` for 2xx.
pub(crate) fn classify_status(status: StatusCode) -> Option<ProxmoxError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::UNAUTHORIZED => ProxmoxError::Unauthorized,
        StatusCode::FORBIDDEN => ProxmoxError::Forbidden,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ProxmoxError::Unavailable(format!("upstream returned {}", status))
        }
        other => ProxmoxError::Status(other),
    })
}

fn transport_error(e: reqwest::Error) -> ProxmoxError {
    // URLs can carry a vncticket; never keep them in the message.
    let e = e.without_url();
    if e.is_timeout() {
        ProxmoxError::Unavailable("timeout".to_string())
    } else if e.is_connect() {
        ProxmoxError::Unavailable(format!("connect failed: {}", e))
    } else {
        ProxmoxError::Unavailable(e.to_string())
    }
}

// ============================================================================
// HTTP client
// ============================================================================

/// reqwest-backed [`ProxmoxApi`].
pub struct HttpProxmoxClient {
    http: reqwest::Client,
    endpoint: ProxmoxEndpoint,
    default_realm: String,
}

impl HttpProxmoxClient {
    pub fn new(cfg: &ProxmoxConfig) -> vmportal_common::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .danger_accept_invalid_certs(!cfg.verify_tls)
            .build()
            .map_err(|e| vmportal_common::Error::Internal(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: ProxmoxEndpoint::from_config(cfg)?,
            default_realm: cfg.default_realm.clone(),
        })
    }

    fn qualified_username(&self, username: &str) -> String {
        if username.contains('@') {
            username.to_string()
        } else {
            format!("{}@{}", username, self.default_realm)
        }
    }

    async fn decode<T: DeserializeOwned>(
        resp: reqwest::Response,
        what: &'static str,
    ) -> Result<T, ProxmoxError> {
        if let Some(err) = classify_status(resp.status()) {
            debug!(call = what, status = %resp.status(), "Proxmox call rejected");
            return Err(err);
        }
        let body = resp.text().await.map_err(transport_error)?;
        parse_envelope(&body, what)
    }
}

#[async_trait]
impl ProxmoxApi for HttpProxmoxClient {
    fn endpoint(&self) -> &ProxmoxEndpoint {
        &self.endpoint
    }

    async fn login(&self, credentials: &Credentials) -> Result<ProxmoxAuth, ProxmoxError> {
        let url = self.endpoint.api_url("/api2/json/access/ticket");
        let username = self.qualified_username(&credentials.username);
        debug!("Proxmox login for {} at {}", username, url);

        let form = AuthTicketForm {
            username: &username,
            password: credentials.password.expose(),
        };

        let resp = self
            .http
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let data: AuthTicketData = Self::decode(resp, "access/ticket").await?;
        if data.ticket.is_empty() {
            error!("Proxmox login returned an empty ticket");
            return Err(ProxmoxError::Malformed("access/ticket: empty ticket".into()));
        }

        Ok(ProxmoxAuth {
            username: data.username.unwrap_or(username),
            cookie: Secret::new(data.ticket),
            csrf_token: data.csrf_prevention_token.map(Secret::new),
        })
    }

    async fn vnc_proxy(
        &self,
        auth: &ProxmoxAuth,
        node: &NodeName,
        vmid: VmId,
    ) -> Result<VncProxyTicket, ProxmoxError> {
        let url = self
            .endpoint
            .api_url(&format!("/api2/json/nodes/{}/qemu/{}/vncproxy", node, vmid));
        debug!("Requesting VNC proxy at {}", url);

        let mut req = self
            .http
            .post(url)
            .header(header::COOKIE, auth.cookie_header())
            .form(&VncProxyParams { websocket: 1 });
        if let Some(csrf) = &auth.csrf_token {
            req = req.header("CSRFPreventionToken", csrf.expose());
        }

        let resp = req.send().await.map_err(transport_error)?;
        let data: VncProxyData = Self::decode(resp, "vncproxy").await?;
        if data.ticket.is_empty() {
            error!(node = %node, vmid = %vmid, "vncproxy returned an empty ticket");
            return Err(ProxmoxError::Malformed("vncproxy: empty ticket".into()));
        }

        debug!("Retrieved Proxmox VNC port {}", data.port);
        Ok(VncProxyTicket {
            ticket: Secret::new(data.ticket),
            port: data.port,
        })
    }

    async fn console_bootstrap(&self, session: &ConsoleSession) -> Result<BootstrapPage, ProxmoxError> {
        let url = self.endpoint.bootstrap_url(
            &session.node,
            session.vmid,
            session.proxmox_port,
            &session.ticket,
        );
        debug!(node = %session.node, vmid = %session.vmid, "Fetching console bootstrap");

        let resp = self
            .http
            .get(url)
            .header(header::COOKIE, format!("PVEAuthCookie={}", session.auth_cookie.expose()))
            .header(header::ACCEPT_ENCODING, "identity")
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(transport_error)?.to_vec();

        Ok(BootstrapPage {
            status,
            headers,
            body,
        })
    }
}
