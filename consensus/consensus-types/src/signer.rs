// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! The local validator's signing identity: one baker id and the three key
//! pairs consensus signs with.

use crate::{
    committee::FinalizerInfo,
    common::{BakerId, FinalizerIndex, Ratio},
};
use kestrel_crypto::{
    bls::{BlsSecretKey, BlsSignature},
    ed25519::{Ed25519PrivateKey, Ed25519Signature},
    vrf::{VrfProofValue, VrfSecretKey},
};

#[derive(Clone, Debug)]
pub struct ConsensusSigner {
    baker_id: BakerId,
    block_key: Ed25519PrivateKey,
    aggregation_key: BlsSecretKey,
    vrf_key: VrfSecretKey,
}

impl ConsensusSigner {
    pub fn new(
        baker_id: BakerId,
        block_key: Ed25519PrivateKey,
        aggregation_key: BlsSecretKey,
        vrf_key: VrfSecretKey,
    ) -> Self {
        Self {
            baker_id,
            block_key,
            aggregation_key,
            vrf_key,
        }
    }

    /// A signer with freshly generated keys, for tests and local networks.
    pub fn random(baker_id: BakerId) -> Self {
        Self {
            baker_id,
            block_key: Ed25519PrivateKey::generate(&mut rand::rngs::OsRng),
            aggregation_key: BlsSecretKey::generate(&mut rand::rngs::OsRng),
            vrf_key: VrfSecretKey::generate(&mut rand_core::OsRng),
        }
    }

    pub fn baker_id(&self) -> BakerId {
        self.baker_id
    }

    pub fn sign_with_block_key(&self, message: &[u8]) -> Ed25519Signature {
        self.block_key.sign(message)
    }

    pub fn sign_with_aggregation_key(&self, message: &[u8]) -> BlsSignature {
        self.aggregation_key.sign(message)
    }

    pub fn prove_vrf(&self, message: &[u8]) -> VrfProofValue {
        self.vrf_key.prove(message)
    }

    pub fn block_key(&self) -> &Ed25519PrivateKey {
        &self.block_key
    }

    /// The committee record this signer occupies at `index` with `weight`
    /// and `lottery_power`.
    pub fn finalizer_info(
        &self,
        index: FinalizerIndex,
        weight: u64,
        lottery_power: Ratio,
    ) -> FinalizerInfo {
        FinalizerInfo {
            index,
            baker_id: self.baker_id,
            weight,
            lottery_power,
            sign_key: self.block_key.public_key(),
            aggregation_key: self.aggregation_key.public_key(),
            vrf_key: self.vrf_key.public_key(),
        }
    }
}
