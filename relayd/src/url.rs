use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::str::FromStr;

use serde::de::{Error, Visitor};
use serde::{Deserializer, Serialize, Serializer};
use url::ParseError;

/// An RPC endpoint URL. Endpoint URLs frequently embed provider API keys in
/// the path, so a sensitive URL renders as `[REDACTED]` in logs and error
/// reports while still dereferencing to the real value for connections.
#[derive(Hash, PartialEq, Eq, Clone)]
pub struct Url {
    inner: url::Url,
    is_sensitive: bool,
}

impl Url {
    fn new(url: url::Url, is_sensitive: bool) -> Self {
        Self { inner: url, is_sensitive }
    }

    pub fn new_sensitive(s: &str) -> Result<Self, ParseError> {
        url::Url::parse(s).map(|url| Self::new(url, true))
    }

    pub fn new_non_sensitive(s: &str) -> Result<Self, ParseError> {
        url::Url::parse(s).map(|url| Self::new(url, false))
    }

    /// Whether this endpoint speaks a connection-oriented transport capable
    /// of server-initiated delivery. Anything else is treated as
    /// request/response only.
    pub fn is_push_capable(&self) -> bool {
        matches!(self.inner.scheme(), "ws" | "wss")
    }

    pub fn deserialize_sensitive<'de, D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_string(UrlVisitor { is_sensitive: true })
    }
}

impl Deref for Url {
    type Target = url::Url;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl FromStr for Url {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new_sensitive(s)
    }
}

impl Serialize for Url {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.inner.as_str())
    }
}

impl Display for Url {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_sensitive {
            f.write_str("[REDACTED]")
        } else {
            f.write_str(self.inner.as_str())
        }
    }
}

impl Debug for Url {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

struct UrlVisitor {
    is_sensitive: bool,
}

impl Visitor<'_> for UrlVisitor {
    type Value = Url;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a well-formed url string")
    }

    fn visit_str<E>(self, url: &str) -> Result<Self::Value, E>
    where
        E: Error,
    {
        if self.is_sensitive {
            Url::new_sensitive(url).map_err(|err: ParseError| E::custom(err.to_string()))
        } else {
            Url::new_non_sensitive(url).map_err(|err: ParseError| E::custom(err.to_string()))
        }
    }
}
