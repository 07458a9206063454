// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! The minimal genesis record consensus needs: chain parameters, the
//! initial committee, and the hash every signature is bound to.

use crate::{
    committee::{FinalizationCommittee, SignatureThreshold},
    common::{BlockHash, Ratio, Timestamp},
};
use kestrel_crypto::HashValue;
use serde::{Deserialize, Serialize};

/// Chain parameters fixed at genesis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisParameters {
    pub timestamp: Timestamp,
    /// Wall-clock length of an epoch; the first finalized block at or past
    /// the boundary triggers the transition.
    pub epoch_duration_ms: u64,
    pub signature_threshold: SignatureThreshold,
    /// Initial per-round timeout.
    pub base_timeout_ms: u64,
    /// Growth factor applied to the timeout on every timeout event.
    pub timeout_increase: Ratio,
}

/// The genesis configuration: parameters plus the epoch-0 committee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisConfiguration {
    pub parameters: GenesisParameters,
    pub committee: FinalizationCommittee,
}

impl GenesisConfiguration {
    /// The genesis block hash; every quorum and timeout signature commits
    /// to it, so nodes of different chains can never exchange votes.
    pub fn hash(&self) -> BlockHash {
        let bytes = bcs::to_bytes(self).expect("genesis serializes");
        HashValue::sha256_of(&[b"KESTREL_GENESIS", &bytes])
    }

    /// The leadership-election nonce for epoch 0.
    pub fn initial_leadership_nonce(&self) -> HashValue {
        HashValue::sha256_of(&[b"KESTREL_LE_NONCE", self.hash().as_slice()])
    }

    /// The state hash the execution layer starts every chain of this
    /// genesis from.
    pub fn initial_state_hash(&self) -> HashValue {
        HashValue::sha256_of(&[b"KESTREL_GENESIS_STATE", self.hash().as_slice()])
    }
}
