//! Console-attempt error taxonomy and its HTTP mapping.
//!
//! Every variant carries a fixed user-facing message. Upstream bodies and
//! secrets never reach a response; details stay in the server log.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsoleError {
    /// Missing or malformed client input; no upstream call made.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Not signed in to the portal.
    #[error("not signed in")]
    Unauthorized,

    /// Proxmox rejected the credentials (401).
    #[error("proxmox authentication failed")]
    AuthenticationFailed,

    /// Proxmox accepted the credentials but denied console access (403).
    #[error("console access denied")]
    PermissionDenied,

    /// Proxmox unreachable or timed out. The one retryable condition.
    #[error("proxmox unavailable: {0}")]
    Unavailable(String),

    /// Proxmox answered with a body that does not match the expected shape.
    #[error("invalid upstream response")]
    InvalidUpstreamResponse,

    /// Proxmox refused the request with some other error status.
    #[error("proxmox rejected the request with {0}")]
    UpstreamRejected(StatusCode),

    /// Non-200 while fetching the console bootstrap; the status is propagated.
    #[error("console page fetch returned {0}")]
    UpstreamStatus(StatusCode),

    #[error("bad gateway: {0}")]
    BadGateway(String),

    /// No pending console session for the key (never existed or expired).
    #[error("no pending console session")]
    SessionNotFound,

    #[error("csrf token mismatch")]
    CsrfMismatch,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ConsoleError {
    pub fn status(&self) -> StatusCode {
        match self {
            ConsoleError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ConsoleError::Unauthorized => StatusCode::UNAUTHORIZED,
            ConsoleError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            ConsoleError::PermissionDenied => StatusCode::FORBIDDEN,
            ConsoleError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ConsoleError::InvalidUpstreamResponse => StatusCode::INTERNAL_SERVER_ERROR,
            ConsoleError::UpstreamRejected(_) => StatusCode::BAD_GATEWAY,
            ConsoleError::UpstreamStatus(status) => *status,
            ConsoleError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ConsoleError::SessionNotFound => StatusCode::UNAUTHORIZED,
            ConsoleError::CsrfMismatch => StatusCode::FORBIDDEN,
            ConsoleError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the browser.
    pub fn public_message(&self) -> &'static str {
        match self {
            ConsoleError::BadRequest(_) => "bad request",
            ConsoleError::Unauthorized => "unauthorized",
            ConsoleError::AuthenticationFailed => "authentication failed, please sign in again",
            ConsoleError::PermissionDenied => {
                "console access denied: missing permission, contact your administrator"
            }
            ConsoleError::Unavailable(_) => "service unavailable, please retry",
            ConsoleError::InvalidUpstreamResponse => "invalid upstream response",
            ConsoleError::UpstreamRejected(_) => "the console could not be started",
            ConsoleError::UpstreamStatus(_) => "the console page could not be loaded",
            ConsoleError::BadGateway(_) => "console host unreachable",
            ConsoleError::SessionNotFound => "console session expired, request a new ticket",
            ConsoleError::CsrfMismatch => "invalid csrf token",
            ConsoleError::Internal(_) => "internal error",
        }
    }

    /// Stable machine-readable kind, used by the audit log.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsoleError::BadRequest(_) => "bad_request",
            ConsoleError::Unauthorized => "unauthorized",
            ConsoleError::AuthenticationFailed => "authentication_failed",
            ConsoleError::PermissionDenied => "permission_denied",
            ConsoleError::Unavailable(_) => "unavailable",
            ConsoleError::InvalidUpstreamResponse => "invalid_upstream_response",
            ConsoleError::UpstreamRejected(_) => "upstream_rejected",
            ConsoleError::UpstreamStatus(_) => "upstream_status",
            ConsoleError::BadGateway(_) => "bad_gateway",
            ConsoleError::SessionNotFound => "session_not_found",
            ConsoleError::CsrfMismatch => "csrf_mismatch",
            ConsoleError::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsoleError::Unavailable(_))
    }

    /// Plain-text response, used by the relay route.
    pub fn into_plain_response(self) -> Response {
        (self.status(), self.public_message()).into_response()
    }

    /// Minimal HTML error page, used by the console page route.
    pub fn into_html_response(self) -> Response {
        let status = self.status();
        let body = format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Console unavailable</title></head>\
             <body><h1>Console unavailable</h1><p>{}</p></body></html>",
            self.public_message()
        );
        (
            status,
            [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
            body,
        )
            .into_response()
    }
}

impl From<vmportal_common::Error> for ConsoleError {
    fn from(e: vmportal_common::Error) -> Self {
        match e {
            vmportal_common::Error::InvalidInput { field, reason } => {
                ConsoleError::BadRequest(format!("{}: {}", field, reason))
            }
            other => ConsoleError::Internal(other.to_string()),
        }
    }
}

/// JSON error body: `{success: false, error}`.
impl IntoResponse for ConsoleError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(serde_json::json!({
                "success": false,
                "error": self.public_message(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_and_permission_are_distinguishable() {
        let auth = ConsoleError::AuthenticationFailed;
        let perm = ConsoleError::PermissionDenied;
        assert_eq!(auth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(perm.status(), StatusCode::FORBIDDEN);
        assert_ne!(auth.public_message(), perm.public_message());
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(ConsoleError::Unavailable("timeout".into()).is_retryable());
        assert!(!ConsoleError::InvalidUpstreamResponse.is_retryable());
        assert!(!ConsoleError::PermissionDenied.is_retryable());
        assert!(!ConsoleError::BadGateway("refused".into()).is_retryable());
    }

    #[test]
    fn test_public_message_hides_detail() {
        let err = ConsoleError::Unavailable("connect to 10.0.0.5:8006 refused".into());
        assert!(!err.public_message().contains("10.0.0.5"));
    }

    #[test]
    fn test_upstream_status_is_propagated() {
        let err = ConsoleError::UpstreamStatus(StatusCode::NOT_FOUND);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
