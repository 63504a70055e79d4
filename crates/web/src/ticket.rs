//! Ticket Acquirer: obtains a VNC ticket and port from Proxmox for one VM.
//!
//! Credential sources are tried in order:
//! 1. the Proxmox auth stored in the visitor session,
//! 2. username/password supplied with the request,
//! 3. the configured service account, only if explicitly enabled for consoles.
//!
//! A stored cookie that Proxmox rejects with 401 is dropped from the session
//! and the next source is tried. Every other failure ends the attempt.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use vmportal_common::{
    ConsoleGrant, ConsoleKey, ConsoleSession, NodeName, PortalConfig, ServiceAccountConfig, VmId,
};

use crate::audit::{AuditLog, ConsoleAuditEvent};
use crate::error::ConsoleError;
use crate::proxmox::{Credentials, ProxmoxApi, ProxmoxAuth, ProxmoxError, VncProxyTicket};
use crate::session::VisitorSession;

/// Where the Proxmox credentials for a ticket came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    SessionCookie,
    ExplicitLogin,
    ServiceAccount,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::SessionCookie => "session_cookie",
            CredentialSource::ExplicitLogin => "explicit_login",
            CredentialSource::ServiceAccount => "service_account",
        }
    }
}

/// A successfully acquired ticket, ready to be stored in the registry.
#[derive(Debug, Clone)]
pub struct AcquiredTicket {
    pub session: ConsoleSession,
    pub source: CredentialSource,
}

/// Parse and validate the `vmid`/`node` pair of a console request.
pub fn parse_console_key(
    vmid: Option<&str>,
    node: Option<&str>,
    cfg: &PortalConfig,
) -> Result<ConsoleKey, ConsoleError> {
    let vmid: VmId = vmid
        .ok_or_else(|| ConsoleError::BadRequest("missing vmid".into()))?
        .parse()?;
    let node: NodeName = node
        .ok_or_else(|| ConsoleError::BadRequest("missing node".into()))?
        .parse()?;
    if !cfg.proxmox.node_allowed(node.as_str()) {
        return Err(ConsoleError::BadRequest(format!("unknown node {}", node)));
    }
    Ok(ConsoleKey::new(vmid, node))
}

pub(crate) fn map_proxmox_error(e: ProxmoxError) -> ConsoleError {
    match e {
        ProxmoxError::Unauthorized => ConsoleError::AuthenticationFailed,
        ProxmoxError::Forbidden => ConsoleError::PermissionDenied,
        ProxmoxError::Unavailable(reason) => ConsoleError::Unavailable(reason),
        ProxmoxError::Malformed(_) => ConsoleError::InvalidUpstreamResponse,
        ProxmoxError::Status(status) => ConsoleError::UpstreamRejected(status),
    }
}

pub struct TicketAcquirer {
    api: Arc<dyn ProxmoxApi>,
    service_account: Option<ServiceAccountConfig>,
    ttl: ChronoDuration,
    retry_backoff: Duration,
    audit: AuditLog,
}

impl TicketAcquirer {
    pub fn new(api: Arc<dyn ProxmoxApi>, cfg: &PortalConfig, audit: AuditLog) -> Self {
        let service_account = cfg
            .proxmox
            .service_account
            .clone()
            .filter(|sa| sa.allow_console_fallback);

        Self {
            api,
            service_account,
            ttl: ChronoDuration::seconds(cfg.console.ticket_ttl_secs as i64),
            retry_backoff: Duration::from_millis(cfg.console.retry_backoff_millis),
            audit,
        }
    }

    pub fn api(&self) -> &Arc<dyn ProxmoxApi> {
        &self.api
    }

    /// Obtain a ticket for `key` on behalf of `visitor`. Records an audit
    /// event for every attempt made by a signed-in visitor.
    pub async fn acquire(
        &self,
        visitor: Option<&VisitorSession>,
        key: &ConsoleKey,
        credentials: Option<Credentials>,
    ) -> Result<AcquiredTicket, ConsoleError> {
        let visitor = visitor.ok_or_else(|| {
            debug!(console = %key, "Ticket request without a portal session");
            ConsoleError::Unauthorized
        })?;

        let (source, outcome) = self.acquire_from_sources(visitor, key, credentials).await;

        let audit_outcome = match &outcome {
            Ok(_) => Ok(()),
            Err(e) => Err(e.kind()),
        };
        self.audit.record(&ConsoleAuditEvent::new(
            &visitor.user,
            key,
            source.map(|s| s.as_str()),
            audit_outcome,
        ));

        match outcome {
            Ok((auth, vnc)) => {
                let source = source.unwrap_or(CredentialSource::SessionCookie);
                info!(
                    user = %visitor.user,
                    console = %key,
                    source = source.as_str(),
                    port = vnc.port,
                    ticket = %vnc.ticket,
                    "VNC ticket acquired"
                );
                let session = ConsoleSession::issue(
                    ConsoleGrant {
                        vmid: key.vmid,
                        node: key.node.clone(),
                        proxmox_host: self.api.endpoint().host_port(),
                        proxmox_port: vnc.port,
                        ticket: vnc.ticket,
                        auth_cookie: auth.cookie,
                        csrf_token: auth.csrf_token,
                    },
                    Utc::now(),
                    self.ttl,
                )?;
                Ok(AcquiredTicket { session, source })
            }
            Err(e) => {
                match &e {
                    ConsoleError::AuthenticationFailed | ConsoleError::PermissionDenied => {
                        warn!(user = %visitor.user, console = %key, "Console ticket refused: {}", e)
                    }
                    ConsoleError::InvalidUpstreamResponse => {
                        error!(user = %visitor.user, console = %key, "Console ticket failed: {}", e)
                    }
                    _ => warn!(user = %visitor.user, console = %key, "Console ticket failed: {}", e),
                }
                Err(e)
            }
        }
    }

    async fn acquire_from_sources(
        &self,
        visitor: &VisitorSession,
        key: &ConsoleKey,
        credentials: Option<Credentials>,
    ) -> (
        Option<CredentialSource>,
        Result<(ProxmoxAuth, VncProxyTicket), ConsoleError>,
    ) {
        if let Some(auth) = visitor.proxmox_auth() {
            match self.request_ticket(&auth, key).await {
                Ok(vnc) => return (Some(CredentialSource::SessionCookie), Ok((auth, vnc))),
                Err(ProxmoxError::Unauthorized) => {
                    warn!(user = %visitor.user, "Stored Proxmox session rejected, dropping it");
                    visitor.set_proxmox_auth(None);
                    if credentials.is_none() && self.service_account.is_none() {
                        return (
                            Some(CredentialSource::SessionCookie),
                            Err(ConsoleError::AuthenticationFailed),
                        );
                    }
                }
                Err(e) => return (Some(CredentialSource::SessionCookie), Err(map_proxmox_error(e))),
            }
        }

        if let Some(credentials) = credentials {
            let source = Some(CredentialSource::ExplicitLogin);
            return (source, self.login_and_request(&credentials, key).await);
        }

        if let Some(sa) = &self.service_account {
            let credentials = Credentials::new(sa.username.clone(), sa.password.clone());
            let source = Some(CredentialSource::ServiceAccount);
            return (source, self.login_and_request(&credentials, key).await);
        }

        (None, Err(ConsoleError::AuthenticationFailed))
    }

    async fn login_and_request(
        &self,
        credentials: &Credentials,
        key: &ConsoleKey,
    ) -> Result<(ProxmoxAuth, VncProxyTicket), ConsoleError> {
        let auth = self
            .with_single_retry("access/ticket", || self.api.login(credentials))
            .await
            .map_err(map_proxmox_error)?;
        let vnc = self.request_ticket(&auth, key).await.map_err(map_proxmox_error)?;
        Ok((auth, vnc))
    }

    async fn request_ticket(
        &self,
        auth: &ProxmoxAuth,
        key: &ConsoleKey,
    ) -> Result<VncProxyTicket, ProxmoxError> {
        self.with_single_retry("vncproxy", || self.api.vnc_proxy(auth, &key.node, key.vmid))
            .await
    }

    /// Retry once, after a jittered backoff, when Proxmox is unavailable.
    async fn with_single_retry<T, F, Fut>(&self, call: &'static str, mut op: F) -> Result<T, ProxmoxError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProxmoxError>>,
    {
        match op().await {
            Err(ProxmoxError::Unavailable(reason)) => {
                let delay = self.jittered_backoff();
                warn!(call, "Proxmox unavailable ({}), retrying once in {:?}", reason, delay);
                tokio::time::sleep(delay).await;
                op().await
            }
            other => other,
        }
    }

    fn jittered_backoff(&self) -> Duration {
        let base = self.retry_backoff.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base);
        Duration::from_millis(base + jitter)
    }
}
