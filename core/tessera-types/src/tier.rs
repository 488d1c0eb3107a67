//! Feature tiers.
//!
//! A tier only describes which features a customer gets. Whether a grant
//! ever expires is a separate billing property (`is_lifetime` on the
//! entitlement), so "founders" is deliberately not a tier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Feature tier granted by an entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Hobbyist tier.
    Maker,
    /// Professional tier.
    Pro,
    /// Academic tier.
    Education,
    /// Organisation-wide tier.
    Enterprise,
}

impl Tier {
    /// All tiers, in ascending order of capability.
    pub const ALL: [Tier; 4] = [Tier::Maker, Tier::Education, Tier::Pro, Tier::Enterprise];

    /// Returns the default number of devices that may be bound at once.
    #[must_use]
    pub fn max_devices(&self) -> u32 {
        match self {
            Self::Maker => 2,
            Self::Pro => 3,
            Self::Education => 2,
            Self::Enterprise => 10,
        }
    }

    /// Returns the lowercase wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maker => "maker",
            Self::Pro => "pro",
            Self::Education => "education",
            Self::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "maker" => Ok(Self::Maker),
            "pro" => Ok(Self::Pro),
            "education" => Ok(Self::Education),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(Error::InvalidTier(other.to_string())),
        }
    }
}

/// How much a tier determination can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Exact price identifier match.
    High,
    /// Matched on the rounded purchase amount.
    Medium,
    /// Nothing matched; the fallback tier was used.
    Low,
}

impl Confidence {
    /// Low-confidence determinations must be reviewed by a human.
    #[must_use]
    pub fn needs_review(&self) -> bool {
        matches!(self, Self::Low)
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => f.write_str("high"),
            Self::Medium => f.write_str("medium"),
            Self::Low => f.write_str("low"),
        }
    }
}
