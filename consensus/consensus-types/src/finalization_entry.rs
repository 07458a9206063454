// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    committee::{FinalizationCommittee, SignatureThreshold},
    common::{BlockHash, Epoch, Round},
    quorum_cert::QuorumCert,
    CertificateError,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A pair of quorum certificates on two consecutive rounds of the same
/// epoch, witnessing that the earlier round's block is irreversibly
/// finalized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationEntry {
    finalized_qc: QuorumCert,
    successor_qc: QuorumCert,
}

impl FinalizationEntry {
    pub fn new(finalized_qc: QuorumCert, successor_qc: QuorumCert) -> Self {
        Self {
            finalized_qc,
            successor_qc,
        }
    }

    /// The certificate for the block this entry finalizes.
    pub fn finalized_qc(&self) -> &QuorumCert {
        &self.finalized_qc
    }

    /// The certificate for the finalized block's direct successor.
    pub fn successor_qc(&self) -> &QuorumCert {
        &self.successor_qc
    }

    pub fn finalized_block(&self) -> BlockHash {
        self.finalized_qc.block()
    }

    pub fn round(&self) -> Round {
        self.finalized_qc.round()
    }

    pub fn epoch(&self) -> Epoch {
        self.finalized_qc.epoch()
    }

    /// Structural validity plus both certificates verifying against the
    /// epoch's committee.
    pub fn verify(
        &self,
        genesis: &BlockHash,
        committee: &FinalizationCommittee,
        threshold: SignatureThreshold,
    ) -> Result<(), CertificateError> {
        if self.successor_qc.round() != self.finalized_qc.round() + 1 {
            return Err(CertificateError::Malformed(
                "finalization entry rounds are not consecutive",
            ));
        }
        if self.successor_qc.epoch() != self.finalized_qc.epoch() {
            return Err(CertificateError::Malformed(
                "finalization entry spans epochs",
            ));
        }
        self.finalized_qc.verify(genesis, committee, threshold)?;
        self.successor_qc.verify(genesis, committee, threshold)
    }
}

impl fmt::Display for FinalizationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FinalizationEntry(block: {}, round: {}, epoch: {})",
            self.finalized_block().short_str(),
            self.round(),
            self.epoch()
        )
    }
}
