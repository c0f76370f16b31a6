//! Identifier newtypes
//!
//! Every persisted entity is addressed by an opaque string id. Wrapping the
//! strings keeps a tenant id from being passed where a group id belongs.
//! Ids are UUIDv4 in simple (dashless) form; reconstitution from storage
//! accepts any non-empty string so hand-edited documents keep working.

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generates a fresh random id.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            /// Wraps an id read back from storage or a request body.
            pub fn from_string(value: impl Into<String>) -> Self {
                Self(value.into())
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

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_type!(
    /// Identifies one upstream cloud-drive credential pair.
    TenantId
);
id_type!(
    /// Identifies a named subset of tenants sharing one API key.
    GroupId
);
id_type!(
    /// Identifies a scheduled synchronization task.
    TaskId
);
id_type!(
    /// Identifies one upload or download record.
    TransferId
);
