//! Branded ID newtypes for type safety.
//!
//! Adapters, Processors and in-flight requests are all keyed by strings on
//! the wire. Wrapping each in its own newtype prevents passing a Processor
//! identity where an Adapter identity is expected.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
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
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identity of an Adapter connection (remote address until the platform
    /// reports a durable self id).
    AdapterId
}

branded_id! {
    /// Identity of a Processor connection (its remote address).
    ProcessorId
}

branded_id! {
    /// Broker-minted correlation token for an outstanding request.
    ///
    /// Format: `<issuer>|<unix-nanos>|<seq>`.
    RequestToken
}

/// Separator between token segments. Remote addresses never contain it.
pub const TOKEN_DELIMITER: char = '|';

static TOKEN_SEQ: AtomicU64 = AtomicU64::new(0);

impl RequestToken {
    /// Mint a fresh token for `issuer`.
    ///
    /// The nanosecond timestamp plus a process-wide sequence number keep
    /// tokens unique even when callers reuse their own `echo` values.
    #[must_use]
    pub fn mint(issuer: &str) -> Self {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = TOKEN_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("{issuer}{TOKEN_DELIMITER}{nanos}{TOKEN_DELIMITER}{seq}"))
    }

    /// The issuer prefix, if the token is well formed.
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        issuer_of(&self.0)
    }
}

/// Extract the issuer prefix from a raw token string.
///
/// Returns `None` for strings that were not minted by [`RequestToken::mint`].
#[must_use]
pub fn issuer_of(raw: &str) -> Option<&str> {
    let mut parts = raw.rsplitn(3, TOKEN_DELIMITER);
    let seq = parts.next()?;
    let nanos = parts.next()?;
    let issuer = parts.next()?;
    if issuer.is_empty() || seq.parse::<u64>().is_err() || nanos.parse::<i64>().is_err() {
        return None;
    }
    Some(issuer)
}
