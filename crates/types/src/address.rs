//! Node address value type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Network location of a storage node: a multi-segment address string with
/// a transport part and usually a `/p2p/<peer-id>` suffix, e.g.
/// `/dnsaddr/node-1.example.org/p2p/QmcFf2...`.
///
/// The core validates only basic shape; full multiaddress validity is the
/// networking layer's concern and is enforced when a session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress(String);

impl NodeAddress {
    /// Validate basic shape and wrap the address string.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidNodeAddress("empty address".to_string()));
        }
        if !trimmed.starts_with('/') {
            return Err(Error::InvalidNodeAddress(format!(
                "{trimmed:?} is not a multi-segment address"
            )));
        }
        if trimmed.split('/').skip(1).any(|segment| segment.is_empty()) {
            return Err(Error::InvalidNodeAddress(format!(
                "{trimmed:?} contains an empty segment"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for NodeAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeAddress {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}
