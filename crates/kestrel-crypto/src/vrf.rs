// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Verifiable random function proofs for leader election and block nonces.
//!
//! Backed by schnorrkel's sr25519 VRF. A proof binds a 32-byte pseudo-random
//! output to `(message, public key)`; [`wins_lottery`] reads the output as a
//! big-endian u64 ratio and compares it against a stake-proportional lottery
//! power using integer arithmetic only, so every verifier agrees on the
//! outcome.

use crate::{
    ed25519::impl_fixed_bytes_serde,
    CryptoError, CryptoResult,
};
use schnorrkel::vrf::{VRFPreOut, VRFProof};
use serde::{de, ser, Deserialize, Serialize};
use std::fmt;

const SIGNING_CONTEXT: &[u8] = b"kestrel-vrf";
const OUTPUT_CONTEXT: &[u8] = b"kestrel-vrf-output";

/// A VRF secret key, held only by the local validator.
pub struct VrfSecretKey(schnorrkel::Keypair);

impl VrfSecretKey {
    pub fn generate<R>(rng: &mut R) -> Self
    where
        R: rand_core::RngCore + rand_core::CryptoRng,
    {
        Self(schnorrkel::Keypair::generate_with(rng))
    }

    pub fn public_key(&self) -> VrfPublicKey {
        VrfPublicKey(self.0.public)
    }

    /// Produces a proof and its 32-byte output for `message`.
    pub fn prove(&self, message: &[u8]) -> VrfProofValue {
        let transcript = schnorrkel::signing_context(SIGNING_CONTEXT).bytes(message);
        let (inout, proof, _) = self.0.vrf_sign(transcript);
        VrfProofValue {
            pre_output: inout.to_preout(),
            proof,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.secret.to_bytes().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let secret = schnorrkel::SecretKey::from_bytes(bytes)
            .map_err(|_| CryptoError::MalformedEncoding)?;
        let public = secret.to_public();
        Ok(Self(schnorrkel::Keypair { secret, public }))
    }
}

impl Clone for VrfSecretKey {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.to_bytes()).expect("round-tripping a valid key")
    }
}

impl fmt::Debug for VrfSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VrfSecretKey(<redacted>)")
    }
}

/// A VRF verification key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VrfPublicKey(schnorrkel::PublicKey);

impl VrfPublicKey {
    pub const LENGTH: usize = 32;

    /// Verifies `proof` over `message` and returns the bound output.
    pub fn verify(&self, message: &[u8], proof: &VrfProofValue) -> CryptoResult<[u8; 32]> {
        let transcript = schnorrkel::signing_context(SIGNING_CONTEXT).bytes(message);
        let (inout, _) = self
            .0
            .vrf_verify(transcript, &proof.pre_output, &proof.proof)
            .map_err(|_| CryptoError::InvalidProof)?;
        Ok(inout.make_bytes(OUTPUT_CONTEXT))
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        schnorrkel::PublicKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::MalformedEncoding)
    }
}

impl fmt::Debug for VrfPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VrfPublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl_fixed_bytes_serde!(VrfPublicKey);

/// A VRF proof together with its pre-output point.
#[derive(Clone)]
pub struct VrfProofValue {
    pre_output: VRFPreOut,
    proof: VRFProof,
}

impl PartialEq for VrfProofValue {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for VrfProofValue {}

impl VrfProofValue {
    /// 32-byte pre-output followed by the 64-byte proof.
    pub const LENGTH: usize = 96;

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let mut bytes = [0u8; Self::LENGTH];
        bytes[..32].copy_from_slice(&self.pre_output.to_bytes());
        bytes[32..].copy_from_slice(&self.proof.to_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != Self::LENGTH {
            return Err(CryptoError::WrongLength {
                expected: Self::LENGTH,
                got: bytes.len(),
            });
        }
        let pre_output =
            VRFPreOut::from_bytes(&bytes[..32]).map_err(|_| CryptoError::MalformedEncoding)?;
        let proof =
            VRFProof::from_bytes(&bytes[32..]).map_err(|_| CryptoError::MalformedEncoding)?;
        Ok(Self { pre_output, proof })
    }
}

impl fmt::Debug for VrfProofValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VrfProofValue({})", hex::encode(&self.to_bytes()[..8]))
    }
}

impl_fixed_bytes_serde!(VrfProofValue);

/// Whether `output` wins a lottery with power `numerator / denominator`.
///
/// Win iff `draw / 2^64 < numerator / denominator`, evaluated as
/// `draw * denominator < numerator * 2^64` in u128. A power of one always
/// wins; a power of zero never does.
pub fn wins_lottery(output: &[u8; 32], numerator: u64, denominator: u64) -> bool {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&output[..8]);
    let draw = u64::from_be_bytes(buf);
    (draw as u128) * (denominator as u128) < (numerator as u128) << 64
}
