// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! The finalization committee for an epoch: who may sign, with what keys,
//! and at what weight.

use crate::{
    common::{BakerId, FinalizerIndex, Ratio},
    finalizer_set::FinalizerSet,
};
use kestrel_crypto::{bls::BlsPublicKey, ed25519::Ed25519PublicKey, vrf::VrfPublicKey};
use serde::{Deserialize, Serialize};

/// One seat in the finalization committee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerInfo {
    pub index: FinalizerIndex,
    pub baker_id: BakerId,
    pub weight: u64,
    /// The seat's stake share in the round-leader lottery.
    pub lottery_power: Ratio,
    /// Key the finalizer signs blocks and timeout envelopes with.
    pub sign_key: Ed25519PublicKey,
    /// Key quorum/timeout signatures are aggregated under.
    pub aggregation_key: BlsPublicKey,
    /// Key leader-election and block-nonce proofs verify against.
    pub vrf_key: VrfPublicKey,
}

/// The committee for one epoch. Seats are dense: `members[i].index == i`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationCommittee {
    members: Vec<FinalizerInfo>,
    total_weight: u64,
}

impl FinalizationCommittee {
    pub fn new(members: Vec<FinalizerInfo>) -> Self {
        let total_weight = members.iter().map(|m| m.weight).sum();
        Self {
            members,
            total_weight,
        }
    }

    pub fn finalizer(&self, index: FinalizerIndex) -> Option<&FinalizerInfo> {
        self.members.get(index as usize)
    }

    pub fn finalizer_by_baker(&self, baker_id: BakerId) -> Option<&FinalizerInfo> {
        self.members.iter().find(|m| m.baker_id == baker_id)
    }

    pub fn members(&self) -> &[FinalizerInfo] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Sum of the weights of the seats named by `set`, ignoring indices
    /// outside the committee.
    pub fn weight_of(&self, set: &FinalizerSet) -> u64 {
        set.iter()
            .filter_map(|index| self.finalizer(index))
            .map(|m| m.weight)
            .sum()
    }

    /// Aggregation keys for the seats named by `set`, or `None` if any
    /// index is outside the committee.
    pub fn aggregation_keys(&self, set: &FinalizerSet) -> Option<Vec<&BlsPublicKey>> {
        set.iter()
            .map(|index| self.finalizer(index).map(|m| &m.aggregation_key))
            .collect()
    }
}

/// The minimum fraction of committee weight a certificate must carry.
///
/// This is the single threshold inequality shared by quorum-certificate
/// validation, timeout-certificate validation and both vote aggregators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureThreshold {
    numerator: u64,
    denominator: u64,
}

impl SignatureThreshold {
    /// Two thirds, the protocol default.
    pub const TWO_THIRDS: SignatureThreshold = SignatureThreshold {
        numerator: 2,
        denominator: 3,
    };

    pub fn new(numerator: u64, denominator: u64) -> Self {
        assert!(denominator != 0 && numerator <= denominator);
        Self {
            numerator,
            denominator,
        }
    }

    /// `signed_weight / total_weight >= threshold`, in integer arithmetic.
    pub fn met_by(&self, signed_weight: u64, total_weight: u64) -> bool {
        (signed_weight as u128) * (self.denominator as u128)
            >= (total_weight as u128) * (self.numerator as u128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::ConsensusSigner;

    fn committee(weights: &[u64]) -> FinalizationCommittee {
        let members = weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let signer = ConsensusSigner::random(i as BakerId);
                signer.finalizer_info(i as FinalizerIndex, *w, Ratio::new(1, 1))
            })
            .collect();
        FinalizationCommittee::new(members)
    }

    #[test]
    fn weight_of_ignores_foreign_indices() {
        let committee = committee(&[10, 20, 30]);
        assert_eq!(committee.total_weight(), 60);
        let set = FinalizerSet::from_indices([0, 2, 17]);
        assert_eq!(committee.weight_of(&set), 40);
    }

    #[test]
    fn aggregation_keys_rejects_foreign_indices() {
        let committee = committee(&[1, 1]);
        assert!(committee
            .aggregation_keys(&FinalizerSet::from_indices([0, 1]))
            .is_some());
        assert!(committee
            .aggregation_keys(&FinalizerSet::from_indices([0, 5]))
            .is_none());
    }

    #[test]
    fn threshold_boundary() {
        let threshold = SignatureThreshold::TWO_THIRDS;
        assert!(threshold.met_by(2, 3));
        assert!(!threshold.met_by(1, 3));
        // exactly two thirds of a non-divisible total
        assert!(threshold.met_by(40, 60));
        assert!(!threshold.met_by(39, 60));
    }
}
