//! Web server implementation

use axum::{
    extract::{ws::WebSocketUpgrade, rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use vmportal_common::{Database, PortalConfig, Secret};

use crate::audit::AuditLog;
use crate::error::ConsoleError;
use crate::proxmox::{Credentials, HttpProxmoxClient, ProxmoxApi, ProxmoxError};
use crate::relay::{self, Relay, UpstreamDialer};
use crate::rewrite::MarkupRewriter;
use crate::session::{constant_time_eq, SessionStore, VisitorSession, CSRF_HEADER};
use crate::static_files::StaticFiles;
use crate::ticket::{map_proxmox_error, parse_console_key, TicketAcquirer};

/// Web server state
#[derive(Clone)]
pub struct WebServer {
    state: Arc<WebServerState>,
}

struct WebServerState {
    cfg: PortalConfig,
    sessions: SessionStore,
    acquirer: TicketAcquirer,
    rewriter: MarkupRewriter,
    dialer: UpstreamDialer,
    relay: Relay,
    static_files: StaticFiles,
    /// Root of every relay's cancellation token
    shutdown: CancellationToken,
}

impl WebServer {
    /// Build a server around an explicit Proxmox API and audit log.
    pub fn new(
        cfg: PortalConfig,
        proxmox: Arc<dyn ProxmoxApi>,
        audit: AuditLog,
        shutdown: CancellationToken,
    ) -> vmportal_common::Result<Self> {
        let endpoint = proxmox.endpoint().clone();
        let rewriter = MarkupRewriter::new(&endpoint, &cfg.console.relay_path, &cfg.console.asset_root)
            .map_err(|e| vmportal_common::Error::Internal(format!("rewrite rules: {}", e)))?;
        let dialer = UpstreamDialer::new(
            endpoint,
            cfg.proxmox.verify_tls,
            Duration::from_secs(cfg.proxmox.connect_timeout_secs),
        )
        .map_err(|e| vmportal_common::Error::Internal(e.to_string()))?;
        let static_files = StaticFiles::new(cfg.console.novnc_dir.clone());
        if !static_files.is_configured() {
            warn!(
                asset_root = %cfg.console.asset_root,
                "No console.novnc_dir set; noVNC assets will not be served"
            );
        }

        Ok(Self {
            state: Arc::new(WebServerState {
                sessions: SessionStore::new(cfg.session.clone()),
                acquirer: TicketAcquirer::new(proxmox, &cfg, audit),
                rewriter,
                dialer,
                relay: Relay::new(Duration::from_millis(cfg.console.close_grace_millis)),
                static_files,
                shutdown,
                cfg,
            }),
        })
    }

    /// Build a server talking to the configured Proxmox over HTTP.
    pub fn from_config(cfg: PortalConfig, shutdown: CancellationToken) -> vmportal_common::Result<Self> {
        let proxmox = Arc::new(HttpProxmoxClient::new(&cfg.proxmox)?);
        let audit = AuditLog::new(Database::open(&cfg.audit.db_path)?)?;
        Self::new(cfg, proxmox, audit, shutdown)
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.state.sessions
    }

    /// Create router
    pub fn router(&self) -> Router {
        let console = &self.state.cfg.console;

        Router::new()
            .route("/api/health", get(health_handler))
            .route("/api/login", post(login_handler))
            .route("/api/logout", post(logout_handler))
            .route("/api/console/ticket", post(console_ticket_handler))
            .route("/console", get(console_page_handler))
            .route(&console.relay_path, get(console_relay_handler))
            .route(&format!("{}/*path", console.asset_root), get(novnc_asset_handler))
            .fallback(not_found_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the web server; returns once the shutdown token is cancelled
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("vmportal listening on http://{}", listener.local_addr()?);

        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("vmportal stopped");
        Ok(())
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "vmportal",
        "version": vmportal_common::VERSION,
    }))
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

// ============================================================================
// Visitor login
// ============================================================================

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: Secret,
    #[serde(default)]
    realm: Option<String>,
}

async fn login_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<(CookieJar, Json<serde_json::Value>), ConsoleError> {
    let Json(req) = body.map_err(|e| ConsoleError::BadRequest(e.body_text()))?;
    if req.username.trim().is_empty() || req.password.is_empty() {
        return Err(ConsoleError::BadRequest("username and password are required".into()));
    }

    let username = match req.realm.as_deref().map(str::trim) {
        Some(realm) if !realm.is_empty() && !req.username.contains('@') => {
            format!("{}@{}", req.username.trim(), realm)
        }
        _ => req.username.trim().to_string(),
    };

    let auth = state
        .acquirer
        .api()
        .login(&Credentials::new(username.clone(), req.password))
        .await
        .map_err(|e| {
            warn!(user = %username, "Portal login rejected: {}", e);
            map_proxmox_error(e)
        })?;

    let user = auth.username.clone();
    let session = state.sessions.create(&user, Some(auth));
    info!(user = %user, "Portal login");

    let jar = jar.add(state.sessions.cookie_for(&session));
    Ok((
        jar,
        Json(serde_json::json!({
            "success": true,
            "user": user,
            "csrf_token": session.csrf_token.expose(),
        })),
    ))
}

async fn logout_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<(CookieJar, Json<serde_json::Value>), ConsoleError> {
    let visitor = state.sessions.from_jar(&jar).ok_or(ConsoleError::Unauthorized)?;
    check_csrf(&visitor, &headers)?;

    state.sessions.remove(&visitor.id);
    info!(user = %visitor.user, "Portal logout");
    let jar = jar.remove(state.sessions.removal_cookie());
    Ok((jar, Json(serde_json::json!({ "success": true }))))
}

fn check_csrf(visitor: &VisitorSession, headers: &HeaderMap) -> Result<(), ConsoleError> {
    let presented = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok());
    if visitor.verify_csrf(presented) {
        Ok(())
    } else {
        warn!(user = %visitor.user, "CSRF token mismatch");
        Err(ConsoleError::CsrfMismatch)
    }
}

// ============================================================================
// Console ticket
// ============================================================================

#[derive(Debug, Deserialize)]
struct TicketRequest {
    #[serde(default)]
    vmid: Option<serde_json::Value>,
    #[serde(default)]
    node: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<Secret>,
}

/// Accept a JSON number or string for an id-like parameter.
fn param_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => Some(String::new()),
    }
}

async fn console_ticket_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    headers: HeaderMap,
    body: Result<Json<TicketRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ConsoleError> {
    let visitor = state.sessions.from_jar(&jar).ok_or(ConsoleError::Unauthorized)?;
    check_csrf(&visitor, &headers)?;

    let Json(req) = body.map_err(|e| ConsoleError::BadRequest(e.body_text()))?;
    let vmid = param_string(req.vmid.as_ref());
    let key = parse_console_key(vmid.as_deref(), req.node.as_deref(), &state.cfg)?;

    let credentials = match (req.username, req.password) {
        (Some(user), Some(password)) if !user.trim().is_empty() && !password.is_empty() => {
            Some(Credentials::new(user.trim(), password))
        }
        (None, None) => None,
        _ => {
            return Err(ConsoleError::BadRequest(
                "username and password must be given together".into(),
            ))
        }
    };

    let acquired = state.acquirer.acquire(Some(&*visitor), &key, credentials).await?;
    let session = acquired.session;
    let response = serde_json::json!({
        "success": true,
        "ticket": session.ticket.expose(),
        "port": session.proxmox_port,
    });
    if visitor.consoles.put(session) {
        debug!(console = %key, "Replaced an unconsumed console session");
    }
    Ok(Json(response))
}

// ============================================================================
// Console page
// ============================================================================

async fn console_page_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match console_page(&state, &jar, &params).await {
        Ok(resp) => resp,
        Err(e) => e.into_html_response(),
    }
}

async fn console_page(
    state: &WebServerState,
    jar: &CookieJar,
    params: &HashMap<String, String>,
) -> Result<Response, ConsoleError> {
    let key = parse_console_key(
        params.get("vmid").map(String::as_str),
        params.get("node").map(String::as_str),
        &state.cfg,
    )?;
    let visitor = state.sessions.from_jar(jar).ok_or(ConsoleError::Unauthorized)?;

    let session = visitor
        .consoles
        .take_if_valid(&key, Utc::now())
        .ok_or(ConsoleError::SessionNotFound)?;

    let page = state
        .acquirer
        .api()
        .console_bootstrap(&session)
        .await
        .map_err(|e| match e {
            ProxmoxError::Unavailable(reason) => {
                warn!(console = %key, "Console bootstrap unreachable: {}", reason);
                ConsoleError::BadGateway(reason)
            }
            other => map_proxmox_error(other),
        })?;

    let response = state.rewriter.render(page, &session)?;

    // Re-arm the same slot for the relay; expires_at is unchanged.
    visitor.consoles.put(session);
    Ok(response)
}

// ============================================================================
// Console relay
// ============================================================================

struct RelayParams {
    port: u16,
    vncticket: String,
}

fn relay_params(
    params: &HashMap<String, String>,
    cfg: &PortalConfig,
) -> Result<(vmportal_common::ConsoleKey, RelayParams), ConsoleError> {
    let key = parse_console_key(
        params.get("vmid").map(String::as_str),
        params.get("node").map(String::as_str),
        cfg,
    )?;
    let port = params
        .get("port")
        .ok_or_else(|| ConsoleError::BadRequest("missing port".into()))?
        .parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| ConsoleError::BadRequest("invalid port".into()))?;
    let vncticket = params
        .get("vncticket")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ConsoleError::BadRequest("missing vncticket".into()))?
        .clone();
    Ok((key, RelayParams { port, vncticket }))
}

async fn console_relay_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    Query(params): Query<HashMap<String, String>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let (key, requested) = match relay_params(&params, &state.cfg) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Relay request rejected: {}", e);
            return e.into_plain_response();
        }
    };
    let Some(ws) = ws else {
        return ConsoleError::BadRequest("websocket upgrade required".into()).into_plain_response();
    };
    let Some(visitor) = state.sessions.from_jar(&jar) else {
        return ConsoleError::Unauthorized.into_plain_response();
    };

    let Some(session) = visitor.consoles.take_if_valid(&key, Utc::now()) else {
        warn!(user = %visitor.user, console = %key, "Relay without a pending console session");
        return ConsoleError::SessionNotFound.into_plain_response();
    };
    if session.proxmox_port != requested.port
        || !constant_time_eq(session.ticket.expose(), &requested.vncticket)
    {
        warn!(user = %visitor.user, console = %key, "Relay parameters do not match the console session");
        return ConsoleError::SessionNotFound.into_plain_response();
    }

    info!(user = %visitor.user, console = %key, "Console relay upgrade");
    let dialer = state.dialer.clone();
    let relay = state.relay.clone();
    let token = state.shutdown.child_token();
    ws.protocols(["binary"])
        .on_upgrade(move |socket| relay::serve_browser(socket, session, dialer, relay, token))
}

// ============================================================================
// Vendored noVNC assets
// ============================================================================

async fn novnc_asset_handler(
    State(state): State<Arc<WebServerState>>,
    Path(path): Path<String>,
) -> Response {
    state.static_files.serve(&path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    fn server() -> WebServer {
        WebServer::from_config_for_tests()
    }

    impl WebServer {
        fn from_config_for_tests() -> Self {
            let mut cfg = PortalConfig::default();
            cfg.proxmox.base_url = "https://127.0.0.1:1".into();
            let proxmox = Arc::new(HttpProxmoxClient::new(&cfg.proxmox).unwrap());
            let audit = AuditLog::new(Database::open_memory().unwrap()).unwrap();
            WebServer::new(cfg, proxmox, audit, CancellationToken::new()).unwrap()
        }
    }

    #[tokio::test]
    async fn test_health() {
        let resp = server()
            .router()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_relay_rejects_bad_params_before_upgrade() {
        let router = server().router();
        for uri in [
            "/console/ws?node=pve1&port=5901&vncticket=PVEVNC:x",
            "/console/ws?vmid=abc&node=pve1&port=5901&vncticket=PVEVNC:x",
            "/console/ws?vmid=100&node=pve1&port=99999&vncticket=PVEVNC:x",
            "/console/ws?vmid=100&node=pve1&port=5901",
            "/console/ws?vmid=100&node=-bad&port=5901&vncticket=PVEVNC:x",
        ] {
            let resp = router
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_ticket_requires_session_and_csrf() {
        let server = server();
        let router = server.router();

        let resp = router
            .clone()
            .oneshot(
                Request::post("/api/console/ticket")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"vmid":100,"node":"pve1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let visitor = server.sessions().create("alice@pve", None);
        let cookie = format!("{}={}", server.sessions().cookie_name(), visitor.id);
        let resp = router
            .oneshot(
                Request::post("/api/console/ticket")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::COOKIE, cookie)
                    .header(CSRF_HEADER, "wrong")
                    .body(Body::from(r#"{"vmid":100,"node":"pve1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_console_page_without_pending_session() {
        let server = server();
        let visitor = server.sessions().create("alice@pve", None);
        let cookie = format!("{}={}", server.sessions().cookie_name(), visitor.id);
        let resp = server
            .router()
            .oneshot(
                Request::get("/console?vmid=100&node=pve1")
                    .header(header::COOKIE, cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/html; charset=utf-8");
    }

    #[test]
    fn test_param_string() {
        assert_eq!(param_string(Some(&serde_json::json!(100))).as_deref(), Some("100"));
        assert_eq!(param_string(Some(&serde_json::json!("100"))).as_deref(), Some("100"));
        assert_eq!(param_string(Some(&serde_json::json!(true))).as_deref(), Some(""));
        assert_eq!(param_string(None), None);
    }
}
