//! Stable, time-sortable identifiers.
//!
//! Every entity kind in the store gets its own newtype over a ULID string,
//! following the same pattern as the original `FactId`. Keeping them
//! distinct prevents accidentally passing an `EntityId` where a `FactId`
//! is expected.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Ulid::new().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
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

id_type!(ContentItemId);
id_type!(EntityId);
id_type!(AliasId);
id_type!(FactId);
id_type!(ProvenanceId);
id_type!(FactLinkId);
id_type!(ConflictId);
id_type!(OperationId);
id_type!(MetricId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_display_as_ulid() {
        let a = FactId::new();
        let b = FactId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 26);
    }
}
