//! Customers and customer references.
//!
//! Upstream payloads refer to customers in several shapes: a bare id, a
//! provider customer string, an expanded `{ "id": .. }` object, or relation
//! wrappers such as `{ "connect": [..] }` and `{ "set": .. }`. All of them are
//! normalised into a single [`CustomerRef`] at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CustomerId, Error};

/// A customer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: CustomerId,
    pub email: Option<String>,
    /// Billing provider's customer identifier (e.g. `cus_...`).
    pub provider_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A normalised reference to a customer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum CustomerRef {
    /// Our own customer identifier.
    Id(CustomerId),
    /// The billing provider's customer identifier.
    Provider(String),
}

impl CustomerRef {
    /// Normalises any of the accepted relation shapes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCustomerRef`] for empty values, empty relation
    /// lists, relation lists with more than one element, or unsupported JSON
    /// types.
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        match value {
            Value::String(s) => Self::from_str_ref(s),
            Value::Number(n) => Ok(Self::Provider(n.to_string())),
            Value::Object(map) => {
                if let Some(id) = map.get("id") {
                    return Self::from_value(id);
                }
                if let Some(inner) = map.get("connect").or_else(|| map.get("set")) {
                    return Self::from_relation_list(inner);
                }
                Err(Error::InvalidCustomerRef(
                    "object must contain id, connect or set".to_string(),
                ))
            }
            Value::Null => Err(Error::InvalidCustomerRef("null".to_string())),
            other => Err(Error::InvalidCustomerRef(format!(
                "unsupported value: {other}"
            ))),
        }
    }

    fn from_str_ref(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidCustomerRef("empty string".to_string()));
        }
        match CustomerId::parse(s) {
            Ok(id) => Ok(Self::Id(id)),
            Err(_) => Ok(Self::Provider(s.to_string())),
        }
    }

    fn from_relation_list(value: &Value) -> Result<Self, Error> {
        match value {
            Value::Array(items) => match items.as_slice() {
                [single] => Self::from_value(single),
                [] => Err(Error::InvalidCustomerRef("empty relation list".to_string())),
                _ => Err(Error::InvalidCustomerRef(
                    "relation list must reference exactly one customer".to_string(),
                )),
            },
            other => Self::from_value(other),
        }
    }
}
