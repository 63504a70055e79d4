//! vmportal web server
//!
//! Brokers browser access to Proxmox VE VM consoles: acquires VNC tickets,
//! serves a rewritten noVNC bootstrap page and relays the VNC websocket
//! through the portal's own origin.

pub mod audit;
pub mod error;
pub mod proxmox;
pub mod registry;
pub mod relay;
pub mod rewrite;
pub mod server;
pub mod session;
pub mod static_files;
pub mod ticket;

pub use audit::{AuditLog, ConsoleAuditEvent};
pub use error::ConsoleError;
pub use proxmox::{HttpProxmoxClient, ProxmoxApi, ProxmoxEndpoint, ProxmoxError};
pub use registry::ConsoleRegistry;
pub use relay::{Frame, Relay, RelayError, UpstreamDialer};
pub use rewrite::MarkupRewriter;
pub use server::WebServer;
pub use session::{SessionStore, VisitorSession};
pub use ticket::{CredentialSource, TicketAcquirer};
