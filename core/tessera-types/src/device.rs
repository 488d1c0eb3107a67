//! Device records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{CustomerId, DeviceId, DeviceRecordId, EntitlementId, Error};

/// Operating system family reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Macos,
    Linux,
}

impl Platform {
    /// Returns the lowercase wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Macos => "macos",
            Self::Linux => "linux",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "windows" => Ok(Self::Windows),
            "macos" => Ok(Self::Macos),
            "linux" => Ok(Self::Linux),
            other => Err(Error::InvalidPlatform(other.to_string())),
        }
    }
}

/// A device registered by a customer.
///
/// A device is bound to at most one entitlement at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceRecordId,
    pub customer_id: CustomerId,
    pub device_id: DeviceId,
    pub name: Option<String>,
    pub platform: Option<Platform>,
    pub last_seen_at: DateTime<Utc>,
    pub entitlement_id: Option<EntitlementId>,
    pub created_at: DateTime<Utc>,
}

impl Device {
    /// Creates an unbound device record.
    #[must_use]
    pub fn new(customer_id: CustomerId, device_id: DeviceId, now: DateTime<Utc>) -> Self {
        Self {
            id: DeviceRecordId::new(),
            customer_id,
            device_id,
            name: None,
            platform: None,
            last_seen_at: now,
            entitlement_id: None,
            created_at: now,
        }
    }

    /// Returns true if this device is bound to the given entitlement.
    #[must_use]
    pub fn is_bound_to(&self, entitlement_id: &EntitlementId) -> bool {
        self.entitlement_id.as_ref() == Some(entitlement_id)
    }
}

/// Public key bound to a device during air-gapped provisioning.
///
/// The binding is permanent: it is never rotated in-band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    /// Ed25519 public key, SPKI DER, standard base64.
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}
