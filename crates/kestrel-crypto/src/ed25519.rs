// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Ed25519 keys and signatures for block signing and timeout message
//! envelopes.

use crate::{CryptoError, CryptoResult};
use ed25519_dalek::{Signer, Verifier};
use serde::{de, ser, Deserialize, Serialize};
use std::fmt;

/// An Ed25519 signing key, held only by the local validator.
pub struct Ed25519PrivateKey {
    keypair: ed25519_dalek::Keypair,
}

impl Ed25519PrivateKey {
    pub fn generate<R>(rng: &mut R) -> Self
    where
        R: rand::RngCore + rand::CryptoRng,
    {
        Self {
            keypair: ed25519_dalek::Keypair::generate(rng),
        }
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.keypair.public)
    }

    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        Ed25519Signature(self.keypair.sign(message))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.keypair.secret.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let secret = ed25519_dalek::SecretKey::from_bytes(bytes)
            .map_err(|_| CryptoError::MalformedEncoding)?;
        let public = ed25519_dalek::PublicKey::from(&secret);
        Ok(Self {
            keypair: ed25519_dalek::Keypair { secret, public },
        })
    }
}

impl Clone for Ed25519PrivateKey {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.to_bytes()).expect("round-tripping a valid key")
    }
}

impl fmt::Debug for Ed25519PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519PrivateKey(<redacted>)")
    }
}

/// An Ed25519 verification key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519PublicKey(ed25519_dalek::PublicKey);

impl Ed25519PublicKey {
    pub const LENGTH: usize = 32;

    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> CryptoResult<()> {
        self.0
            .verify(message, &signature.0)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != Self::LENGTH {
            return Err(CryptoError::WrongLength {
                expected: Self::LENGTH,
                got: bytes.len(),
            });
        }
        ed25519_dalek::PublicKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::MalformedEncoding)
    }
}

impl std::hash::Hash for Ed25519PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// A detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signature(ed25519_dalek::Signature);

impl Ed25519Signature {
    pub const LENGTH: usize = 64;

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != Self::LENGTH {
            return Err(CryptoError::WrongLength {
                expected: Self::LENGTH,
                got: bytes.len(),
            });
        }
        ed25519_dalek::Signature::try_from(bytes)
            .map(Self)
            .map_err(|_| CryptoError::MalformedEncoding)
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Signature({})", hex::encode(&self.to_bytes()[..8]))
    }
}

macro_rules! impl_fixed_bytes_serde {
    ($type:ty) => {
        impl Serialize for $type {
            fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&hex::encode(self.to_bytes()))
                } else {
                    serializer.serialize_bytes(&self.to_bytes())
                }
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let bytes = if deserializer.is_human_readable() {
                    let encoded = <String>::deserialize(deserializer)?;
                    hex::decode(&encoded).map_err(de::Error::custom)?
                } else {
                    <serde_bytes::ByteBuf>::deserialize(deserializer)?.into_vec()
                };
                <$type>::from_bytes(&bytes).map_err(de::Error::custom)
            }
        }
    };
}

impl_fixed_bytes_serde!(Ed25519PublicKey);
impl_fixed_bytes_serde!(Ed25519Signature);

pub(crate) use impl_fixed_bytes_serde;

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    #[test]
    fn sign_verify() {
        let key = Ed25519PrivateKey::generate(&mut rand::rngs::OsRng);
        let sig = key.sign(b"message");
        assert_ok!(key.public_key().verify(b"message", &sig));
        assert_err!(key.public_key().verify(b"other message", &sig));
    }

    #[test]
    fn wrong_key_rejects() {
        let key = Ed25519PrivateKey::generate(&mut rand::rngs::OsRng);
        let other = Ed25519PrivateKey::generate(&mut rand::rngs::OsRng);
        let sig = key.sign(b"message");
        assert_err!(other.public_key().verify(b"message", &sig));
    }

    #[test]
    fn key_bytes_round_trip() {
        let key = Ed25519PrivateKey::generate(&mut rand::rngs::OsRng);
        let restored = Ed25519PrivateKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(key.public_key(), restored.public_key());
    }
}
