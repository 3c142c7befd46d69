//! Validated identifier types
//!
//! Every identifier is a distinct newtype over `String` so a `HandleId` can
//! never be passed where a `ToolName` is expected. All of them use
//! `parse()` constructors returning `Result` and (de)serialize through the
//! same validation.
//!
//! ```rust
//! use keel_core::identifiers::{HandleId, ToolName};
//!
//! let tool = ToolName::parse("weather").unwrap();
//! let handle: HandleId = "weather-server".parse().unwrap();
//! assert_eq!(tool.as_str(), "weather");
//! assert!(ToolName::parse("../etc").is_err());
//! # let _ = handle;
//! ```

use crate::validation::{IdentifierRules, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! validated_id {
    ($(#[$meta:meta])* $name:ident, $rules:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parse and validate an identifier from a string.
            pub fn parse(id: impl AsRef<str>) -> Result<Self, ValidationError> {
                $rules.validate(id.as_ref()).map(Self)
            }

            /// Get the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Create an identifier without validation (tests and literals only).
            #[doc(hidden)]
            pub fn new_unchecked(id: impl Into<String>) -> Self {
                Self(id.into())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = ValidationError;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }
    };
}

validated_id!(
    /// Unique name of a tool in the registry and within a plan.
    ToolName,
    IdentifierRules::TOOL_NAME
);

validated_id!(
    /// Identifier of a capability handle owned by the supervisor.
    HandleId,
    IdentifierRules::IDENTIFIER
);

validated_id!(
    /// Caller-supplied identifier of an inbound request.
    RequestId,
    IdentifierRules::IDENTIFIER
);

validated_id!(
    /// Name of a memory namespace.
    Namespace,
    IdentifierRules::NAMESPACE
);

validated_id!(
    /// Key of a memory entry, unique within its namespace.
    MemoryKey,
    IdentifierRules::MEMORY_KEY
);

impl RequestId {
    /// Generate a fresh request id (`req-<uuid>`).
    pub fn generate() -> Self {
        Self(format!("req-{}", uuid::Uuid::new_v4()))
    }
}
