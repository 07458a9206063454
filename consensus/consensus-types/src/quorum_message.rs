// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    common::{BlockHash, Epoch, FinalizerIndex, Round},
    quorum_cert::QuorumSignatureMessage,
};
use kestrel_crypto::{
    bls::{BlsPublicKey, BlsSignature},
    CryptoResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One finalizer's vote to certify `block` in `round`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumMessage {
    pub finalizer: FinalizerIndex,
    pub block: BlockHash,
    pub round: Round,
    pub epoch: Epoch,
    /// BLS signature over `(genesis, block, round, epoch)`.
    pub signature: BlsSignature,
}

impl QuorumMessage {
    /// Builds and signs a vote with `sign` applied to the canonical
    /// signing bytes.
    pub fn create<F>(
        genesis: &BlockHash,
        finalizer: FinalizerIndex,
        block: BlockHash,
        round: Round,
        epoch: Epoch,
        sign: F,
    ) -> Self
    where
        F: FnOnce(&[u8]) -> BlsSignature,
    {
        let message = QuorumSignatureMessage {
            genesis,
            block: &block,
            round,
            epoch,
        };
        let signature = sign(&message.signing_bytes());
        Self {
            finalizer,
            block,
            round,
            epoch,
            signature,
        }
    }

    pub fn verify(&self, genesis: &BlockHash, key: &BlsPublicKey) -> CryptoResult<()> {
        let message = QuorumSignatureMessage {
            genesis,
            block: &self.block,
            round: self.round,
            epoch: self.epoch,
        };
        self.signature.verify(&message.signing_bytes(), key)
    }
}

impl fmt::Display for QuorumMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QuorumMessage(finalizer: {}, block: {}, round: {}, epoch: {})",
            self.finalizer,
            self.block.short_str(),
            self.round,
            self.epoch
        )
    }
}
