//! Identity types for the reflex kernel
//!
//! Identifiers are opaque strings. Generated ids carry a short prefix so that
//! logs and audit records stay readable; ids supplied by callers are accepted
//! verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate string ID types with common implementations
macro_rules! define_id_type {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::new_v4().simple()))
            }

            /// Wrap an existing identifier
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id_type!(CapsuleId, "cap", "Unique identifier for a capsule (one unit of work)");
define_id_type!(AgentId, "agent", "Unique identifier for an assisting or provisioned agent");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_prefixed_and_unique() {
        let a = CapsuleId::new();
        let b = CapsuleId::new();
        assert!(a.as_str().starts_with("cap_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_supplied_ids_are_verbatim() {
        let id = AgentId::from("translator-7");
        assert_eq!(id.to_string(), "translator-7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"translator-7\"");
    }
}
