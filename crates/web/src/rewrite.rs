//! Asset/markup rewriter for the Proxmox noVNC bootstrap page.
//!
//! A textual patch of known upstream markup, applied in order:
//! 1. Proxmox origins are stripped so URLs resolve against the portal,
//! 2. the Proxmox host left in quoted strings or as `host:port` is removed,
//! 3. `.../api2/json/nodes/.../vncwebsocket` URLs become the portal relay URL,
//! 4. legacy `/websockify` paths become the portal relay URL,
//! 5. noVNC asset prefixes move under the vendored asset root,
//! 6. a runtime shim is injected before `</head>`.
//!
//! Host rules only match where a hostname can stand on its own, so a node or
//! file named like the host (`pve`, `pve.css`) is left alone.
//!
//! This is coupled to the noVNC layout Proxmox ships. The fixture test at the
//! bottom pins the markup it is known to handle.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use regex_lite::{Captures, NoExpand, Regex};
use tracing::{debug, warn};

use vmportal_common::ConsoleSession;

use crate::error::ConsoleError;
use crate::proxmox::{BootstrapPage, ProxmoxEndpoint};

/// Upstream headers never passed through to the browser.
const DROPPED_HEADERS: &[&str] = &[
    "content-length",
    "content-encoding",
    "content-type",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
    "set-cookie",
];

const SHIM_TEMPLATE: &str = r#"<script>
(function () {
  var relay = __RELAY__;
  var assets = __ASSETS__;
  function relayUrl() {
    return (location.protocol === 'https:' ? 'wss:' : 'ws:') + '//' + location.host + relay;
  }
  function toRelay(url) {
    var s = String(url);
    if (s.indexOf('vncwebsocket') !== -1 || s.indexOf('websockify') !== -1) {
      return relayUrl();
    }
    return s;
  }
  function toLocal(url) {
    var s = String(url);
    var m = s.match(/^(?:https?:)?\/\/[^\/]+(\/.*)?$/);
    if (m && s.indexOf('//' + location.host) === -1) {
      s = m[1] || '/';
    }
    if (s.indexOf('/novnc/') === 0) {
      return assets + s.substring(6);
    }
    if (s.indexOf('/vm/app/') === 0) {
      return assets + s.substring(3);
    }
    return s;
  }
  var NativeWebSocket = window.WebSocket;
  function PortalWebSocket(url, protocols) {
    var target = toRelay(url);
    return protocols === undefined
      ? new NativeWebSocket(target)
      : new NativeWebSocket(target, protocols);
  }
  PortalWebSocket.prototype = NativeWebSocket.prototype;
  PortalWebSocket.CONNECTING = NativeWebSocket.CONNECTING;
  PortalWebSocket.OPEN = NativeWebSocket.OPEN;
  PortalWebSocket.CLOSING = NativeWebSocket.CLOSING;
  PortalWebSocket.CLOSED = NativeWebSocket.CLOSED;
  window.WebSocket = PortalWebSocket;
  var nativeFetch = window.fetch;
  if (nativeFetch) {
    window.fetch = function (input, init) {
      if (typeof input === 'string' || input instanceof URL) {
        input = toLocal(input);
      }
      return nativeFetch.call(this, input, init);
    };
  }
})();
</script>
"#;

pub struct MarkupRewriter {
    relay_path: String,
    asset_root: String,
    hostname: String,
    vnc_websocket: Regex,
    websockify: Regex,
    origin: Regex,
    quoted_host: Regex,
    host_port: Regex,
    asset_prefix: Regex,
    head_close: Regex,
}

impl MarkupRewriter {
    pub fn new(
        endpoint: &ProxmoxEndpoint,
        relay_path: &str,
        asset_root: &str,
    ) -> Result<Self, regex_lite::Error> {
        let host = regex_lite::escape(endpoint.hostname());
        Ok(Self {
            relay_path: relay_path.to_string(),
            asset_root: asset_root.to_string(),
            hostname: endpoint.hostname().to_string(),
            vnc_websocket: Regex::new(
                r#"(?:(?:(?:https?|wss?):)?//[^/"'\s]+)?/?api2/json/nodes/[^"'\s?]+/vncwebsocket(?:\?[^"'\s]*)?"#,
            )?,
            websockify: Regex::new(r"/websockify")?,
            origin: Regex::new(&format!(
                r#"(?:(?:https?|wss?):)?//{}(?::\d+)?([/"'`\s?#]|$)"#,
                host
            ))?,
            quoted_host: Regex::new(&format!(r#"(["'`]){}(?::\d+)?(["'`/])"#, host))?,
            host_port: Regex::new(&format!(r"(^|[^A-Za-z0-9._-]){}:\d+", host))?,
            asset_prefix: Regex::new(r#"(^|["'(=\s,])(/novnc/|/vm/app/|\./app/|app/)"#)?,
            head_close: Regex::new(r"(?i)</head>")?,
        })
    }

    /// Root-relative relay URL for one console session.
    pub fn relay_url(&self, session: &ConsoleSession) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("vmid", &session.vmid.to_string())
            .append_pair("node", session.node.as_str())
            .append_pair("port", &session.proxmox_port.to_string())
            .append_pair("vncticket", session.ticket.expose())
            .finish();
        format!("{}?{}", self.relay_path, query)
    }

    fn shim(&self, relay_url: &str) -> String {
        // JSON string literals are valid JS string literals.
        let relay = serde_json::Value::from(relay_url).to_string();
        let assets = serde_json::Value::from(self.asset_root.as_str()).to_string();
        SHIM_TEMPLATE
            .replace("__RELAY__", &relay)
            .replace("__ASSETS__", &assets)
    }

    /// Apply the rewrite rules to the bootstrap markup.
    pub fn rewrite(&self, html: &str, session: &ConsoleSession) -> String {
        let relay_url = self.relay_url(session);

        let out = if self.hostname.is_empty() {
            html.to_string()
        } else {
            let out = self.origin.replace_all(html, "${1}");
            let stray = self.quoted_host.find_iter(&out).count() + self.host_port.find_iter(&out).count();
            if stray > 0 {
                debug!(count = stray, "Removing bare Proxmox host references");
            }
            let out = self.quoted_host.replace_all(&out, "${1}${2}");
            self.host_port.replace_all(&out, "${1}").into_owned()
        };

        // The relay URL goes in after host stripping so its node value is never touched.
        let out = self.vnc_websocket.replace_all(&out, NoExpand(&relay_url));
        let out = self.websockify.replace_all(&out, NoExpand(&relay_url));

        let out = self
            .asset_prefix
            .replace_all(&out, |caps: &Captures| {
                let mapped = match &caps[2] {
                    "/novnc/" => format!("{}/", self.asset_root),
                    _ => format!("{}/app/", self.asset_root),
                };
                format!("{}{}", &caps[1], mapped)
            })
            .into_owned();

        let shim = self.shim(&relay_url);
        match self.head_close.find(&out) {
            Some(m) => {
                let mut patched = String::with_capacity(out.len() + shim.len());
                patched.push_str(&out[..m.start()]);
                patched.push_str(&shim);
                patched.push_str(&out[m.start()..]);
                patched
            }
            None => {
                warn!("Console bootstrap has no </head>; prepending runtime shim");
                format!("{}{}", shim, out)
            }
        }
    }

    /// Turn the fetched bootstrap page into the browser response.
    pub fn render(&self, page: BootstrapPage, session: &ConsoleSession) -> Result<Response, ConsoleError> {
        if page.status != StatusCode::OK {
            warn!(
                console = %session.key(),
                status = %page.status,
                "Console bootstrap fetch returned non-200"
            );
            return Err(ConsoleError::UpstreamStatus(page.status));
        }

        let html = String::from_utf8_lossy(&page.body);
        let body = self.rewrite(&html, session);

        let len = body.len();
        let mut response = Response::new(Body::from(body));
        let headers = response.headers_mut();
        copy_passthrough_headers(&page.headers, headers);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        Ok(response)
    }
}

fn copy_passthrough_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from.iter() {
        if is_dropped(name) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

fn is_dropped(name: &HeaderName) -> bool {
    DROPPED_HEADERS.contains(&name.as_str())
}
