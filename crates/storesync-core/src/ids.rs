//! Branded string identifiers.
//!
//! Every identifier wraps a UUID v7 so freshly minted values are unique
//! and sort in creation order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

fn mint(prefix: &str) -> String {
    if prefix.is_empty() {
        Uuid::now_v7().to_string()
    } else {
        format!("{prefix}_{}", Uuid::now_v7())
    }
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh identifier.
            pub fn new() -> Self {
                Self(mint($prefix))
            }

            /// Wrap an existing identifier string without validation.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the identifier as a string slice.
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

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(
    /// Identifier assigned to a client connection when it registers.
    ConnectionId,
    "client"
);
branded_id!(
    /// Identifier stamped on every envelope (a bare UUID on the wire).
    MessageId,
    ""
);
branded_id!(
    /// Identifier shared by all envelopes of one bulk change.
    BatchId,
    "batch"
);
