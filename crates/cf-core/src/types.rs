//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved site name meaning "the caller's home cluster"
pub const CURRENT_SITE_SHORTCUT: &str = "-current-";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Name of a managed host, unique within its site
    HostId
);

string_id!(
    /// Interactive session identifier, unique per host
    SessionId
);

string_id!(
    /// One participant's membership in an interactive session
    PartyId
);

impl SessionId {
    /// Fresh random session id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl PartyId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Whether `name` is usable as a session id, host name or storage key segment:
/// 1 to 128 characters of `[A-Za-z0-9._@-]`, and not `.` or `..`
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'))
}

/// Local host name, used when the config leaves it unset
pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}
