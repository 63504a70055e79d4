//! Console data model shared between the ticket, markup and relay stages

use crate::{Error, Result, Secret};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest VMID Proxmox hands out.
pub const MAX_VMID: u32 = 999_999_999;

/// Proxmox node names are hostname labels.
const MAX_NODE_LEN: usize = 63;

/// Proxmox VM identifier (positive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct VmId(u32);

impl VmId {
    pub fn new(value: u32) -> Result<Self> {
        if value == 0 || value > MAX_VMID {
            return Err(Error::invalid_input(
                "vmid",
                format!("must be between 1 and {}", MAX_VMID),
            ));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl FromStr for VmId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value: u32 = s
            .trim()
            .parse()
            .map_err(|_| Error::invalid_input("vmid", "not a positive integer"))?;
        Self::new(value)
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for VmId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(u64),
            Str(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => u32::try_from(n)
                .map_err(|_| serde::de::Error::custom("vmid out of range"))
                .and_then(|n| VmId::new(n).map_err(serde::de::Error::custom)),
            Repr::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Proxmox cluster node name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(Error::invalid_input("node", "must not be empty"));
        }
        if value.len() > MAX_NODE_LEN {
            return Err(Error::invalid_input("node", "too long"));
        }
        let bytes = value.as_bytes();
        let valid_chars = bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-');
        if !valid_chars || bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
            return Err(Error::invalid_input("node", "not a valid node name"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for NodeName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s.trim())
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Registry key: one pending console per VM and node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsoleKey {
    pub vmid: VmId,
    pub node: NodeName,
}

impl ConsoleKey {
    pub fn new(vmid: VmId, node: NodeName) -> Self {
        Self { vmid, node }
    }
}

impl fmt::Display for ConsoleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.vmid)
    }
}

/// Ephemeral credential bundle for one console attempt.
///
/// Holds secrets; `Debug` masks them through [`Secret`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleSession {
    pub vmid: VmId,
    pub node: NodeName,
    /// `host:port` of the Proxmox API that issued the ticket.
    pub proxmox_host: String,
    /// VNC port returned by `vncproxy`.
    pub proxmox_port: u16,
    pub ticket: Secret,
    pub auth_cookie: Secret,
    pub csrf_token: Option<Secret>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Everything a console session is built from, minus timestamps.
#[derive(Debug, Clone)]
pub struct ConsoleGrant {
    pub vmid: VmId,
    pub node: NodeName,
    pub proxmox_host: String,
    pub proxmox_port: u16,
    pub ticket: Secret,
    pub auth_cookie: Secret,
    pub csrf_token: Option<Secret>,
}

impl ConsoleSession {
    /// Stamp a grant with `created_at = now` and `expires_at = now + ttl`.
    pub fn issue(grant: ConsoleGrant, now: DateTime<Utc>, ttl: Duration) -> Result<Self> {
        if ttl <= Duration::zero() {
            return Err(Error::InvalidConfig("console ttl must be positive".into()));
        }
        Ok(Self {
            vmid: grant.vmid,
            node: grant.node,
            proxmox_host: grant.proxmox_host,
            proxmox_port: grant.proxmox_port,
            ticket: grant.ticket,
            auth_cookie: grant.auth_cookie,
            csrf_token: grant.csrf_token,
            created_at: now,
            expires_at: now + ttl,
        })
    }

    pub fn key(&self) -> ConsoleKey {
        ConsoleKey::new(self.vmid, self.node.clone())
    }

    /// Valid while `now <= expires_at`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant() -> ConsoleGrant {
        ConsoleGrant {
            vmid: VmId::new(100).unwrap(),
            node: NodeName::new("pve1").unwrap(),
            proxmox_host: "pve.example.com:8006".into(),
            proxmox_port: 5901,
            ticket: Secret::new("PVEVNC:abc"),
            auth_cookie: Secret::new("PVE:root@pam:xyz"),
            csrf_token: None,
        }
    }

    #[test]
    fn test_vmid_bounds() {
        assert!(VmId::new(0).is_err());
        assert!(VmId::new(100).is_ok());
        assert!(VmId::new(MAX_VMID + 1).is_err());
        assert!("abc".parse::<VmId>().is_err());
        assert!("-5".parse::<VmId>().is_err());
        assert_eq!("  101 ".parse::<VmId>().unwrap().get(), 101);
    }

    #[test]
    fn test_node_name_validation() {
        assert!(NodeName::new("pve1").is_ok());
        assert!(NodeName::new("pve-node-02").is_ok());
        assert!(NodeName::new("").is_err());
        assert!(NodeName::new("-pve").is_err());
        assert!(NodeName::new("pve/../etc").is_err());
        assert!(NodeName::new("a".repeat(64)).is_err());
    }

    #[test]
    fn test_vmid_deserializes_from_number_or_string() {
        let a: VmId = serde_json::from_str("100").unwrap();
        let b: VmId = serde_json::from_str("\"100\"").unwrap();
        assert_eq!(a, b);
        assert!(serde_json::from_str::<VmId>("0").is_err());
        assert!(serde_json::from_str::<VmId>("true").is_err());
    }

    #[test]
    fn test_issue_sets_expiry_after_creation() {
        let now = Utc::now();
        let session = ConsoleSession::issue(grant(), now, Duration::seconds(30)).unwrap();
        assert!(session.expires_at > session.created_at);
        assert!(session.is_valid_at(now + Duration::seconds(30)));
        assert!(!session.is_valid_at(now + Duration::seconds(31)));
    }

    #[test]
    fn test_issue_rejects_non_positive_ttl() {
        assert!(ConsoleSession::issue(grant(), Utc::now(), Duration::zero()).is_err());
    }

    #[test]
    fn test_debug_does_not_leak_secrets() {
        let session = ConsoleSession::issue(grant(), Utc::now(), Duration::seconds(5)).unwrap();
        let dbg = format!("{:?}", session);
        assert!(!dbg.contains("root@pam:xyz"));
    }
}
