//! Memory entries shared between the store, its persistence layer and the
//! tools that read or write it.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub use crate::identifiers::{MemoryKey, Namespace};

/// Value stored under a memory key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MemoryValue {
    /// Opaque bytes, never interpreted by the store.
    Bytes(Vec<u8>),
    /// Structured JSON.
    Json(Value),
}

impl MemoryValue {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            MemoryValue::Json(v) => Some(v),
            MemoryValue::Bytes(_) => None,
        }
    }

    /// JSON view of the value. Bytes become an array of numbers.
    pub fn to_json(&self) -> Value {
        match self {
            MemoryValue::Json(v) => v.clone(),
            MemoryValue::Bytes(b) => Value::from(b.clone()),
        }
    }
}

impl From<Value> for MemoryValue {
    fn from(value: Value) -> Self {
        MemoryValue::Json(value)
    }
}

impl From<Vec<u8>> for MemoryValue {
    fn from(bytes: Vec<u8>) -> Self {
        MemoryValue::Bytes(bytes)
    }
}

/// A single stored value with its expiry metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub namespace: Namespace,
    pub key: MemoryKey,
    pub value: MemoryValue,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    /// Create an entry stamped with the current time.
    ///
    /// A TTL too large to represent is treated as no expiry.
    pub fn new(
        namespace: Namespace,
        key: MemoryKey,
        value: MemoryValue,
        ttl: Option<Duration>,
    ) -> Self {
        let created_at = Utc::now();
        let expires_at = ttl
            .and_then(|ttl| TimeDelta::from_std(ttl).ok())
            .and_then(|delta| created_at.checked_add_signed(delta));
        Self {
            namespace,
            key,
            value,
            created_at,
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}
