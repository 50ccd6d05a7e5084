//! Content addressing for immutable blobs and DAG nodes.

use std::fmt;
use std::str::FromStr;

use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Multicodec for raw binary blocks.
pub const RAW_CODEC: u64 = 0x55;

/// Multicodec for dag-json encoded nodes.
pub const DAG_JSON_CODEC: u64 = 0x0129;

/// Self-describing identifier for a piece of content, derived from its
/// content hash.
///
/// Two addresses are equal iff they name bit-identical content under the
/// same codec. Values are constructed by parsing a string form or by
/// hashing content on add, and are never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentAddress(Cid);

impl ContentAddress {
    /// Parse the canonical string form.
    pub fn parse(text: &str) -> Result<Self> {
        let cid = Cid::try_from(text)
            .map_err(|err| Error::InvalidAddress(format!("{text:?}: {err}")))?;
        Ok(Self(cid))
    }

    /// Address a raw binary blob (CIDv1, raw codec, SHA2-256).
    pub fn from_raw(data: &[u8]) -> Self {
        let digest = Code::Sha2_256.digest(data);
        Self(Cid::new_v1(RAW_CODEC, digest))
    }

    /// Address a structured DAG node by its canonical dag-json encoding.
    pub fn from_dag_json(value: &serde_json::Value) -> Result<Self> {
        let encoded = serde_json::to_vec(value)?;
        let digest = Code::Sha2_256.digest(&encoded);
        Ok(Self(Cid::new_v1(DAG_JSON_CODEC, digest)))
    }

    /// The multicodec of the addressed content.
    pub fn codec(&self) -> u64 {
        self.0.codec()
    }

    /// Binary form, used as the record key on the network.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ContentAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ContentAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN_RAW_CID: &str = "bafkreifzjut3te2nhyekklss27nh3k72ysco7y32koao5eei66wof36n5e";

    #[test]
    fn parse_roundtrips_canonical_form() {
        let addr = ContentAddress::parse(KNOWN_RAW_CID).unwrap();
        assert_eq!(addr.to_string(), KNOWN_RAW_CID);
        assert_eq!(ContentAddress::parse(&addr.to_string()).unwrap(), addr);
    }

    #[test]
    fn parse_rejects_malformed_strings() {
        for bad in ["", "hello", "bafkrei!!!", "Qm", "/ip4/127.0.0.1"] {
            match ContentAddress::parse(bad) {
                Err(Error::InvalidAddress(_)) => {}
                other => panic!("expected InvalidAddress for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn raw_address_is_deterministic() {
        let a = ContentAddress::from_raw(b"Hello world!!!");
        let b = ContentAddress::from_raw(b"Hello world!!!");
        let c = ContentAddress::from_raw(b"something else");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.codec(), RAW_CODEC);
    }

    #[test]
    fn dag_address_differs_from_raw_of_same_bytes() {
        let value = serde_json::json!({"k": "v"});
        let encoded = serde_json::to_vec(&value).unwrap();
        let dag = ContentAddress::from_dag_json(&value).unwrap();
        let raw = ContentAddress::from_raw(&encoded);
        assert_ne!(dag, raw);
        assert_eq!(dag.codec(), DAG_JSON_CODEC);
    }

    #[test]
    fn serde_uses_string_form() {
        let addr = ContentAddress::from_raw(b"serde");
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{addr}\""));
        let back: ContentAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
