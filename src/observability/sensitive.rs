// SPDX-License-Identifier: Apache-2.0

//! Redaction of store credentials.
//!
//! Connection URLs and search-index passwords travel through driver
//! constructors that are traced with `#[instrument]`. Wrapping them keeps the
//! secret out of spans, log lines and serialized configuration dumps.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const MASK: &str = "[REDACTED]";
const SERIALIZED_MASK: &str = "***";

/// A credential that only [`Sensitive::expose`] can read back.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// The wrapped value, for handing to the store client.
    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Sensitive<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> fmt::Display for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

impl<T> fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<T: Serialize> Serialize for Sensitive<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(SERIALIZED_MASK)
    }
}

/// Reads the plain value; only the outbound direction is masked.
impl<'de, T: Deserialize<'de>> Deserialize<'de> for Sensitive<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_strings_never_reach_logs() {
        let url = Sensitive::new("postgres://app:hunter2@db/prod".to_string());
        assert_eq!(format!("{url:?}"), "[REDACTED]");
        assert_eq!(url.to_string(), "[REDACTED]");
        assert_eq!(serde_json::to_string(&url).unwrap(), "\"***\"");
        assert!(url.expose().contains("hunter2"));
    }

    #[test]
    fn deserializes_the_plain_value() {
        let url: Sensitive<String> = serde_json::from_str("\"redis://cache\"").unwrap();
        assert_eq!(url.into_inner(), "redis://cache");
    }

    #[test]
    fn nested_in_a_struct_the_secret_stays_masked() {
        #[derive(Debug, Serialize)]
        struct SearchAuth {
            user: String,
            password: Sensitive<String>,
        }
        let auth = SearchAuth {
            user: "reader".into(),
            password: "s3cret".to_string().into(),
        };
        assert!(!format!("{auth:?}").contains("s3cret"));
        assert_eq!(
            serde_json::to_string(&auth).unwrap(),
            r#"{"user":"reader","password":"***"}"#
        );
    }
}
