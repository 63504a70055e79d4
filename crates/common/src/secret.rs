//! Secret values (VNC tickets, PVEAuthCookie, CSRF tokens, passwords).
//!
//! `Debug` and `Display` only ever print a short prefix and the length, so a
//! secret that ends up in a log line or an error message is masked.

use serde::{Deserialize, Deserializer};
use std::fmt;

/// Number of leading characters kept visible when masking.
const VISIBLE_PREFIX: usize = 6;

/// A string that must never be logged or persisted in full.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw value. Only for putting the secret on the wire.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Masked rendering, e.g. `PVEVNC…(len=212)`.
    pub fn masked(&self) -> String {
        mask(&self.0)
    }
}

/// Mask an arbitrary secret string to its first few characters plus length.
pub fn mask(value: &str) -> String {
    let prefix: String = value.chars().take(VISIBLE_PREFIX).collect();
    if prefix.len() == value.len() && value.len() <= VISIBLE_PREFIX {
        // Short values are hidden completely.
        return format!("…(len={})", value.len());
    }
    format!("{}…(len={})", prefix, value.len())
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.masked())
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// Deserialize only: secrets come in from config files and request bodies but
// are never serialized back out implicitly.
impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Secret)
    }
}
