// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! A 32-byte SHA-256 digest used to identify blocks, transactions and state.

use crate::CryptoError;
use serde::{de, ser, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt,
    str::FromStr,
};

/// Output value of the SHA-256 hash function.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashValue {
    hash: [u8; HashValue::LENGTH],
}

impl HashValue {
    /// Length of the digest in bytes.
    pub const LENGTH: usize = 32;

    pub const fn new(hash: [u8; HashValue::LENGTH]) -> Self {
        Self { hash }
    }

    pub const fn zero() -> Self {
        Self {
            hash: [0; HashValue::LENGTH],
        }
    }

    /// Digest of a single byte string.
    pub fn sha256(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::from_digest(hasher)
    }

    /// Digest of the concatenation of several byte strings, with each
    /// chunk fed to the hasher separately.
    pub fn sha256_of(chunks: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for chunk in chunks {
            hasher.update(chunk);
        }
        Self::from_digest(hasher)
    }

    fn from_digest(hasher: Sha256) -> Self {
        let digest = hasher.finalize();
        let mut hash = [0u8; HashValue::LENGTH];
        hash.copy_from_slice(digest.as_slice());
        Self { hash }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != HashValue::LENGTH {
            return Err(CryptoError::WrongLength {
                expected: HashValue::LENGTH,
                got: bytes.len(),
            });
        }
        let mut hash = [0u8; HashValue::LENGTH];
        hash.copy_from_slice(bytes);
        Ok(Self { hash })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.hash
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.hash.to_vec()
    }

    /// First eight bytes interpreted as a big-endian integer, used for
    /// lottery draws.
    pub fn leading_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.hash[..8]);
        u64::from_be_bytes(buf)
    }

    /// A uniformly random hash, only for tests.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut hash = [0u8; HashValue::LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut hash);
        Self { hash }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// First four bytes as hex, for log lines.
    pub fn short_str(&self) -> String {
        hex::encode(&self.hash[..4])
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashValue({})", self.to_hex())
    }
}

impl FromStr for HashValue {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::MalformedEncoding)?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for HashValue {
    fn as_ref(&self) -> &[u8] {
        &self.hash
    }
}

impl Serialize for HashValue {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.hash)
        }
    }
}

impl<'de> Deserialize<'de> for HashValue {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let encoded = <String>::deserialize(deserializer)?;
            HashValue::from_str(&encoded).map_err(de::Error::custom)
        } else {
            let bytes = <serde_bytes::ByteBuf>::deserialize(deserializer)?;
            HashValue::from_slice(bytes.as_ref()).map_err(de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_deterministic() {
        let a = HashValue::sha256(b"kestrel");
        let b = HashValue::sha256(b"kestrel");
        assert_eq!(a, b);
        assert_ne!(a, HashValue::sha256(b"kestral"));
    }

    #[test]
    fn chunked_hashing_matches_concatenation() {
        let whole = HashValue::sha256(b"ab");
        let chunked = HashValue::sha256_of(&[b"a", b"b"]);
        assert_eq!(whole, chunked);
    }

    #[test]
    fn hex_round_trip() {
        let h = HashValue::random();
        let parsed: HashValue = h.to_hex().parse().unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn bcs_round_trip() {
        let h = HashValue::random();
        let bytes = bcs::to_bytes(&h).unwrap();
        let back: HashValue = bcs::from_bytes(&bytes).unwrap();
        assert_eq!(h, back);
    }
}
