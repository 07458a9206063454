// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    committee::{FinalizationCommittee, SignatureThreshold},
    common::{BlockHash, Epoch, Round},
    finalizer_set::FinalizerSet,
    CertificateError,
};
use kestrel_crypto::bls::AggregateSignature;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregate proof that at least a threshold of finalizer weight voted for
/// `block` in `round`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCert {
    block: BlockHash,
    round: Round,
    epoch: Epoch,
    aggregate_signature: AggregateSignature,
    signatories: FinalizerSet,
}

/// The message each quorum signature covers.
#[derive(Serialize)]
pub struct QuorumSignatureMessage<'a> {
    pub genesis: &'a BlockHash,
    pub block: &'a BlockHash,
    pub round: Round,
    pub epoch: Epoch,
}

impl QuorumSignatureMessage<'_> {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = b"KESTREL_QUORUM_MESSAGE".to_vec();
        bytes.extend(bcs::to_bytes(self).expect("quorum message serializes"));
        bytes
    }
}

impl QuorumCert {
    pub fn new(
        block: BlockHash,
        round: Round,
        epoch: Epoch,
        aggregate_signature: AggregateSignature,
        signatories: FinalizerSet,
    ) -> Self {
        Self {
            block,
            round,
            epoch,
            aggregate_signature,
            signatories,
        }
    }

    /// The distinguished certificate for the genesis block: round 0,
    /// epoch 0, no signatures. It is the only valid certificate whose
    /// aggregate is empty.
    pub fn genesis(genesis_hash: BlockHash) -> Self {
        Self {
            block: genesis_hash,
            round: 0,
            epoch: 0,
            aggregate_signature: AggregateSignature::empty(),
            signatories: FinalizerSet::empty(),
        }
    }

    pub fn block(&self) -> BlockHash {
        self.block
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn signatories(&self) -> &FinalizerSet {
        &self.signatories
    }

    pub fn is_genesis(&self) -> bool {
        self.round == 0
    }

    /// Validates the certificate against the committee for its epoch.
    ///
    /// The genesis certificate is valid iff it names the genesis hash;
    /// everything else must carry threshold weight and a verifying
    /// aggregate over `(genesis, block, round, epoch)`.
    pub fn verify(
        &self,
        genesis: &BlockHash,
        committee: &FinalizationCommittee,
        threshold: SignatureThreshold,
    ) -> Result<(), CertificateError> {
        if self.is_genesis() {
            return if self.block == *genesis {
                Ok(())
            } else {
                Err(CertificateError::Malformed("round-0 certificate must name genesis"))
            };
        }
        let signed_weight = committee.weight_of(&self.signatories);
        if !threshold.met_by(signed_weight, committee.total_weight()) {
            return Err(CertificateError::InsufficientWeight);
        }
        let keys = committee
            .aggregation_keys(&self.signatories)
            .ok_or_else(|| {
                let foreign = self
                    .signatories
                    .iter()
                    .find(|i| committee.finalizer(*i).is_none())
                    .unwrap_or_default();
                CertificateError::UnknownFinalizer(foreign)
            })?;
        let message = QuorumSignatureMessage {
            genesis,
            block: &self.block,
            round: self.round,
            epoch: self.epoch,
        };
        self.aggregate_signature
            .verify_aggregate(&message.signing_bytes(), &keys)
            .map_err(|_| CertificateError::InvalidSignature)
    }
}

impl fmt::Display for QuorumCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QC(block: {}, round: {}, epoch: {})",
            self.block.short_str(),
            self.round,
            self.epoch
        )
    }
}
