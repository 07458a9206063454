// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! BLS12-381 signatures in the min_pk setting (public keys in G1,
//! signatures in G2), used for quorum and timeout signature aggregation.
//!
//! Aggregation is incremental: the quorum and timeout modules own a
//! [`SignatureAggregator`] and fold each arriving signature into it rather
//! than re-aggregating from scratch at threshold time.

use crate::{
    ed25519::impl_fixed_bytes_serde,
    CryptoError, CryptoResult,
};
use blst::min_pk as bls;
use serde::{de, ser, Deserialize, Serialize};
use std::fmt;

/// Domain separation tag, fixed for the lifetime of the chain.
const DST: &[u8] = b"KESTREL_BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_";

/// A BLS aggregation secret key.
pub struct BlsSecretKey(bls::SecretKey);

impl BlsSecretKey {
    pub fn generate<R>(rng: &mut R) -> Self
    where
        R: rand::RngCore + rand::CryptoRng,
    {
        let mut ikm = [0u8; 32];
        rng.fill_bytes(&mut ikm);
        Self(bls::SecretKey::key_gen(&ikm, &[]).expect("ikm is 32 bytes"))
    }

    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(self.0.sk_to_pk())
    }

    pub fn sign(&self, message: &[u8]) -> BlsSignature {
        BlsSignature(self.0.sign(message, DST, &[]))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        bls::SecretKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::MalformedEncoding)
    }
}

impl Clone for BlsSecretKey {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.to_bytes()).expect("round-tripping a valid key")
    }
}

impl fmt::Debug for BlsSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSecretKey(<redacted>)")
    }
}

/// A BLS public key (48 bytes compressed, G1).
#[derive(Clone)]
pub struct BlsPublicKey(bls::PublicKey);

impl PartialEq for BlsPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsPublicKey {}

impl BlsPublicKey {
    pub const LENGTH: usize = 48;

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        bls::PublicKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::MalformedEncoding)
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPublicKey({})", hex::encode(&self.to_bytes()[..8]))
    }
}

/// A single BLS signature (96 bytes compressed, G2).
#[derive(Clone)]
pub struct BlsSignature(bls::Signature);

impl PartialEq for BlsSignature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsSignature {}

impl BlsSignature {
    pub const LENGTH: usize = 96;

    pub fn verify(&self, message: &[u8], public_key: &BlsPublicKey) -> CryptoResult<()> {
        match self.0.verify(true, message, DST, &[], &public_key.0, true) {
            blst::BLST_ERROR::BLST_SUCCESS => Ok(()),
            _ => Err(CryptoError::InvalidSignature),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        bls::Signature::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::MalformedEncoding)
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSignature({})", hex::encode(&self.to_bytes()[..8]))
    }
}

impl_fixed_bytes_serde!(BlsPublicKey);
impl_fixed_bytes_serde!(BlsSignature);

/// An aggregated BLS signature over a common message.
///
/// The empty aggregate is the identity used by certificates that carry no
/// signatures (the genesis quorum certificate); it never verifies against a
/// non-empty signer set.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSignature {
    signature: Option<BlsSignature>,
}

impl AggregateSignature {
    pub fn empty() -> Self {
        Self { signature: None }
    }

    pub fn is_empty(&self) -> bool {
        self.signature.is_none()
    }

    /// Verifies the aggregate over `message` against all `public_keys`
    /// (fast aggregate verification: all signers signed the same message).
    pub fn verify_aggregate(
        &self,
        message: &[u8],
        public_keys: &[&BlsPublicKey],
    ) -> CryptoResult<()> {
        let signature = self
            .signature
            .as_ref()
            .ok_or(CryptoError::InvalidSignature)?;
        if public_keys.is_empty() {
            return Err(CryptoError::InvalidSignature);
        }
        let keys: Vec<&bls::PublicKey> = public_keys.iter().map(|pk| &pk.0).collect();
        match signature
            .0
            .fast_aggregate_verify(true, message, DST, &keys)
        {
            blst::BLST_ERROR::BLST_SUCCESS => Ok(()),
            _ => Err(CryptoError::InvalidSignature),
        }
    }

    /// Verifies the aggregate where signers covered differing messages;
    /// `pairs` holds one `(message, public key)` entry per folded
    /// signature, messages repeating where signers shared one.
    pub fn verify_aggregate_with_messages(
        &self,
        pairs: &[(&[u8], &BlsPublicKey)],
    ) -> CryptoResult<()> {
        let signature = self
            .signature
            .as_ref()
            .ok_or(CryptoError::InvalidSignature)?;
        if pairs.is_empty() {
            return Err(CryptoError::InvalidSignature);
        }
        let messages: Vec<&[u8]> = pairs.iter().map(|(message, _)| *message).collect();
        let keys: Vec<&bls::PublicKey> = pairs.iter().map(|(_, pk)| &pk.0).collect();
        match signature.0.aggregate_verify(true, &messages, DST, &keys, true) {
            blst::BLST_ERROR::BLST_SUCCESS => Ok(()),
            _ => Err(CryptoError::InvalidSignature),
        }
    }
}

impl fmt::Debug for AggregateSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.signature {
            Some(sig) => write!(f, "AggregateSignature({})", hex::encode(&sig.to_bytes()[..8])),
            None => write!(f, "AggregateSignature(empty)"),
        }
    }
}

/// Incremental aggregation state.
#[derive(Clone, Debug, Default)]
pub struct SignatureAggregator {
    aggregate: Option<BlsSignature>,
}

impl SignatureAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one signature into the running aggregate.
    pub fn add(&mut self, signature: &BlsSignature) {
        self.aggregate = Some(match self.aggregate.take() {
            None => signature.clone(),
            Some(current) => {
                let mut agg = bls::AggregateSignature::from_signature(&current.0);
                // Individual signatures are verified before they reach the
                // aggregator, so the group check is skipped here.
                agg.add_signature(&signature.0, false)
                    .expect("aggregation without group check is infallible");
                BlsSignature(agg.to_signature())
            }
        });
    }

    pub fn finish(&self) -> AggregateSignature {
        AggregateSignature {
            signature: self.aggregate.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    fn keys(n: usize) -> Vec<BlsSecretKey> {
        (0..n)
            .map(|_| BlsSecretKey::generate(&mut rand::rngs::OsRng))
            .collect()
    }

    #[test]
    fn single_sign_verify() {
        let sk = &keys(1)[0];
        let sig = sk.sign(b"payload");
        assert_ok!(sig.verify(b"payload", &sk.public_key()));
        assert_err!(sig.verify(b"other", &sk.public_key()));
    }

    #[test]
    fn aggregate_verifies_against_all_signers() {
        let sks = keys(4);
        let mut aggregator = SignatureAggregator::new();
        for sk in &sks {
            aggregator.add(&sk.sign(b"round vote"));
        }
        let aggregate = aggregator.finish();
        let pks: Vec<BlsPublicKey> = sks.iter().map(|sk| sk.public_key()).collect();
        let refs: Vec<&BlsPublicKey> = pks.iter().collect();
        assert_ok!(aggregate.verify_aggregate(b"round vote", &refs));
        // dropping one signer breaks verification
        assert_err!(aggregate.verify_aggregate(b"round vote", &refs[..3]));
    }

    #[test]
    fn empty_aggregate_never_verifies() {
        let sk = &keys(1)[0];
        let pk = sk.public_key();
        let empty = AggregateSignature::empty();
        assert_err!(empty.verify_aggregate(b"anything", &[&pk]));
        assert_err!(empty.verify_aggregate(b"anything", &[]));
    }
}
