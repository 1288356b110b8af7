use std::fmt;
use std::str::FromStr;

use ethers::types::{Address, H256};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type EVMAddress = Address;
pub type Hash = H256;

/// Canonical identifier of one logical cross-chain message. Independently
/// derivable by every relay role observing the same message, so two relays
/// agree on identity without coordination.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(H256);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_fixed_bytes()
    }
}

impl From<H256> for MessageId {
    fn from(digest: H256) -> Self {
        Self(digest)
    }
}

impl From<MessageId> for H256 {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Routing origin of a message: the chain it was sent from, the sending
/// application (widened to 32 bytes so non-EVM senders fit), and the
/// channel nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Origin {
    pub src_eid: u32,
    pub sender: H256,
    pub nonce: u64,
}

/// A hex-encoded secp256k1 signing key sourced from configuration. Renders
/// redacted everywhere; the raw material is only handed out once, at wallet
/// construction.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey(String);

impl SigningKey {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl FromStr for SigningKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        hex::decode(raw)?;
        Ok(Self(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for SigningKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let key = String::deserialize(deserializer)?;
        key.parse().map_err(|err| {
            D::Error::custom(format!("signing key is not valid hex: {err}"))
        })
    }
}

impl Serialize for SigningKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl fmt::Display for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Widens an EVM address to the 32-byte form used in the canonical message
/// layout (left-padded with zeroes).
pub fn address_to_bytes32(address: Address) -> H256 {
    H256::from(address)
}
