//! Typed ID wrappers for the entities that cross component boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed ID wrappers prevent mixing up alert ids, run ids, action ids and
/// so on at compile time. They are strings underneath; the uuid-backed
/// ones offer a `generate()` constructor.
macro_rules! typed_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a typed ID from anything that converts to String.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random (uuid v4) ID.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Borrow the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

typed_id!(EventId, "Unique identifier for a telemetry event.");
typed_id!(RuleId, "Identifier for an alert rule (a human-readable slug).");
typed_id!(AlertId, "Unique identifier for a fired alert.");
typed_id!(RunId, "Unique identifier for a ReAct run or investigation.");
typed_id!(ActionId, "Unique identifier for an action approval request.");
typed_id!(ConnectionId, "Unique identifier for a push connection.");
typed_id!(ConversationId, "Identifier grouping the turns of one conversation.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_unique() {
        assert_ne!(RunId::generate(), RunId::generate());
    }

    #[test]
    fn serde_is_transparent() {
        let id = RuleId::new("cpu_critical");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"cpu_critical\"");
        let back: RuleId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn display_is_inner() {
        assert_eq!(AlertId::new("a-1").to_string(), "a-1");
    }
}
