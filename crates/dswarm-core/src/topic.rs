//! Discovery keys.

use std::fmt;

use sha2::{Digest, Sha256};

/// Opaque discovery key identifying a swarm of peers interested in the same
/// resource. Two topics are equal exactly when their lowercase hex forms are.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(Vec<u8>);

impl Topic {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }

    /// Topic for a human-entered name: valid non-empty hex is taken as the
    /// raw key, anything else is hashed into a 32-byte key.
    pub fn from_name(name: &str) -> Self {
        match hex::decode(name) {
            Ok(bytes) if !bytes.is_empty() => Self(bytes),
            _ => Self(Sha256::digest(name.as_bytes()).to_vec()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex key used for set membership and channel names.
    pub fn hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.hex())
    }
}

impl From<&[u8]> for Topic {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_lowercase() {
        let t = Topic::new(vec![0xAB, 0x01]);
        assert_eq!(t.hex(), "ab01");
        assert_eq!(t.to_string(), "ab01");
    }

    #[test]
    fn from_hex_accepts_either_case() {
        assert_eq!(Topic::from_hex("AB01").unwrap(), Topic::from_hex("ab01").unwrap());
    }

    #[test]
    fn from_name_keeps_hex_keys() {
        let t = Topic::from_name("deadbeef");
        assert_eq!(t.as_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn from_name_hashes_plain_names() {
        let t = Topic::from_name("my-archive");
        assert_eq!(t.as_bytes().len(), 32);
        assert_eq!(t, Topic::from_name("my-archive"));
        assert_ne!(t, Topic::from_name("other-archive"));
    }
}
