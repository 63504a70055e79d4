//! Console access audit log.
//!
//! One row per ticket request, success or failure. Rows never contain
//! tickets, cookies or passwords.

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use vmportal_common::{ConsoleKey, Database};

const AUDIT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS console_audit_log (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    user TEXT NOT NULL,
    vmid INTEGER NOT NULL,
    node TEXT NOT NULL,
    source TEXT,
    success INTEGER NOT NULL,
    error_kind TEXT
);
CREATE INDEX IF NOT EXISTS idx_console_audit_timestamp ON console_audit_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_console_audit_user ON console_audit_log(user);
"#;

/// One audited console ticket request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleAuditEvent {
    pub id: String,
    pub timestamp: i64,
    pub user: String,
    pub vmid: u32,
    pub node: String,
    /// Credential source that produced (or last attempted) the ticket
    pub source: Option<String>,
    pub success: bool,
    pub error_kind: Option<String>,
}

impl ConsoleAuditEvent {
    pub fn new(
        user: &str,
        key: &ConsoleKey,
        source: Option<&str>,
        outcome: Result<(), &str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp(),
            user: user.to_string(),
            vmid: key.vmid.get(),
            node: key.node.to_string(),
            source: source.map(String::from),
            success: outcome.is_ok(),
            error_kind: outcome.err().map(String::from),
        }
    }
}

#[derive(Clone)]
pub struct AuditLog {
    db: Database,
}

impl AuditLog {
    pub fn new(db: Database) -> vmportal_common::Result<Self> {
        db.apply_schema(AUDIT_SCHEMA)?;
        Ok(Self { db })
    }

    /// Persist an event and mirror it on the `audit` tracing target.
    pub fn record(&self, event: &ConsoleAuditEvent) {
        if event.success {
            info!(
                target: "audit",
                user = %event.user,
                vmid = event.vmid,
                node = %event.node,
                source = event.source.as_deref().unwrap_or("-"),
                success = true,
                "console ticket issued"
            );
        } else {
            warn!(
                target: "audit",
                user = %event.user,
                vmid = event.vmid,
                node = %event.node,
                source = event.source.as_deref().unwrap_or("-"),
                success = false,
                error_kind = event.error_kind.as_deref().unwrap_or("-"),
                "console ticket refused"
            );
        }

        let conn = self.db.connection();
        let conn = conn.lock();
        let res = conn.execute(
            "INSERT INTO console_audit_log (id, timestamp, user, vmid, node, source, success, error_kind) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id,
                event.timestamp,
                event.user,
                event.vmid,
                event.node,
                event.source,
                event.success,
                event.error_kind,
            ],
        );
        if let Err(e) = res {
            error!(target: "audit", id = %event.id, "Failed to persist audit event: {}", e);
        }
    }

    /// Most recent events first
    pub fn recent(&self, limit: usize) -> vmportal_common::Result<Vec<ConsoleAuditEvent>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, user, vmid, node, source, success, error_kind \
             FROM console_audit_log ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ConsoleAuditEvent {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                user: row.get(2)?,
                vmid: row.get(3)?,
                node: row.get(4)?,
                source: row.get(5)?,
                success: row.get(6)?,
                error_kind: row.get(7)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}
