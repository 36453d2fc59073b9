//! Credential access audit records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatehouseError;

/// What was done to a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessAction {
    Store,
    Read,
    Delete,
}

impl AccessAction {
    /// The tag written to the audit table.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessAction::Store => "STORE",
            AccessAction::Read => "READ",
            AccessAction::Delete => "DELETE",
        }
    }
}

impl fmt::Display for AccessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessAction {
    type Err = GatehouseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STORE" => Ok(AccessAction::Store),
            "READ" => Ok(AccessAction::Read),
            "DELETE" => Ok(AccessAction::Delete),
            other => Err(GatehouseError::Corrupt(format!(
                "unknown audit action '{}'",
                other
            ))),
        }
    }
}

/// One row of the append-only access log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub credential_key: String,
    pub action: AccessAction,
    pub timestamp: DateTime<Utc>,
}

/// How much of the access log to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditRetention {
    /// Never trim
    #[default]
    Unbounded,
    /// Keep only the newest N entries
    MaxEntries(usize),
}

impl AuditRetention {
    pub fn from_max_entries(max: Option<usize>) -> Self {
        max.map_or(AuditRetention::Unbounded, AuditRetention::MaxEntries)
    }
}
