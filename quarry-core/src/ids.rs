//! Validated identifiers shared by every governed resource.
//!
//! Identifiers end up as path components and database namespaces, so the
//! accepted alphabet is deliberately narrow: ASCII alphanumerics, `_` and
//! `-`, at most 64 bytes. Anything else is rejected before it reaches the
//! filesystem.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::GovernorError;

const MAX_IDENTIFIER_LEN: usize = 64;

fn validate(kind: &'static str, raw: &str) -> Result<(), GovernorError> {
    let valid = !raw.is_empty()
        && raw.len() <= MAX_IDENTIFIER_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');

    if valid {
        Ok(())
    } else {
        Err(GovernorError::InvalidIdentifier {
            kind,
            value: raw.to_string(),
        })
    }
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Validate `raw` and wrap it.
            pub fn new(raw: impl Into<String>) -> Result<Self, GovernorError> {
                let raw = raw.into();
                validate($kind, &raw)?;
                Ok(Self(raw))
            }

            /// The validated key.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = GovernorError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::new(raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

identifier!(
    /// Opaque key derived from the authenticated principal. Every
    /// workspace, job and rate-limit counter is partitioned by it.
    TenantId,
    "tenant id"
);

identifier!(
    /// A lesson / content set whose template seeds a workspace.
    ContentSetId,
    "content set id"
);

identifier!(
    /// Name of an editable model file (without the `.sql` extension).
    ModelName,
    "model name"
);

impl TenantId {
    /// Database schema owned by this tenant.
    pub fn namespace(&self, prefix: &str) -> String {
        let mut name = String::with_capacity(prefix.len() + self.0.len());
        name.push_str(prefix);
        name.extend(self.0.chars().map(|c| match c {
            '-' => '_',
            other => other.to_ascii_lowercase(),
        }));
        name
    }
}
