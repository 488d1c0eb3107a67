//! Ledger records: one-time code uses and processed billing events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{CustomerId, DeviceId, EntitlementId, Error};

/// Kind of single-use code recorded in the replay ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeKind {
    Refresh,
    Deactivation,
    Activation,
}

impl CodeKind {
    /// Returns the lowercase wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refresh => "refresh",
            Self::Deactivation => "deactivation",
            Self::Activation => "activation",
        }
    }
}

impl fmt::Display for CodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refresh" => Ok(Self::Refresh),
            "deactivation" => Ok(Self::Deactivation),
            "activation" => Ok(Self::Activation),
            other => Err(Error::InvalidCodeKind(other.to_string())),
        }
    }
}

/// A consumed single-use code, keyed by its `jti`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineCodeUse {
    pub jti: String,
    pub kind: CodeKind,
    pub customer_id: CustomerId,
    pub entitlement_id: EntitlementId,
    pub device_id: DeviceId,
    pub used_at: DateTime<Utc>,
    /// After this instant the record may be garbage-collected.
    pub expires_at: Option<DateTime<Utc>>,
}

/// A billing event that has been handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
    /// Provider creation timestamp (unix seconds).
    pub event_created: i64,
}

/// Outcome of an insert-or-fail against a uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The row was inserted.
    Inserted,
    /// A row with the same key already existed; nothing was written.
    Duplicate,
}

impl InsertOutcome {
    /// Returns true if the row was newly inserted.
    #[must_use]
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted)
    }
}
