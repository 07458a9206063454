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
use std::{collections::BTreeMap, fmt};

/// For one epoch, which finalizers witnessed which round as their highest
/// certified round when they signed a timeout.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerRounds(pub BTreeMap<Round, FinalizerSet>);

impl FinalizerRounds {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn max_round(&self) -> Option<Round> {
        self.0.keys().next_back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Round, &FinalizerSet)> {
        self.0.iter()
    }

    /// All seats across all witnessed rounds.
    pub fn all_finalizers(&self) -> FinalizerSet {
        self.0
            .values()
            .fold(FinalizerSet::empty(), |acc, set| acc.union(set))
    }
}

/// The message each timeout signature covers: the round being abandoned and
/// the signer's view of its highest certified round.
#[derive(Serialize)]
pub struct TimeoutSignatureMessage<'a> {
    pub genesis: &'a BlockHash,
    pub round: Round,
    pub qc_round: Round,
    pub qc_epoch: Epoch,
}

impl TimeoutSignatureMessage<'_> {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = b"KESTREL_TIMEOUT_MESSAGE".to_vec();
        bytes.extend(bcs::to_bytes(self).expect("timeout message serializes"));
        bytes
    }
}

/// Aggregate proof that at least a threshold of finalizer weight abandoned
/// `round`. Signatures may be drawn from up to two consecutive epochs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutCert {
    round: Round,
    min_epoch: Epoch,
    first_epoch_rounds: FinalizerRounds,
    second_epoch_rounds: FinalizerRounds,
    aggregate_signature: AggregateSignature,
}

impl TimeoutCert {
    pub fn new(
        round: Round,
        min_epoch: Epoch,
        first_epoch_rounds: FinalizerRounds,
        second_epoch_rounds: FinalizerRounds,
        aggregate_signature: AggregateSignature,
    ) -> Self {
        Self {
            round,
            min_epoch,
            first_epoch_rounds,
            second_epoch_rounds,
            aggregate_signature,
        }
    }

    /// The round this certificate abandons.
    pub fn round(&self) -> Round {
        self.round
    }

    pub fn min_epoch(&self) -> Epoch {
        self.min_epoch
    }

    pub fn first_epoch_rounds(&self) -> &FinalizerRounds {
        &self.first_epoch_rounds
    }

    pub fn second_epoch_rounds(&self) -> &FinalizerRounds {
        &self.second_epoch_rounds
    }

    /// The newest epoch signatures are drawn from.
    pub fn max_epoch(&self) -> Epoch {
        if self.second_epoch_rounds.is_empty() {
            self.min_epoch
        } else {
            self.min_epoch + 1
        }
    }

    /// The highest certified round witnessed by any signer.
    pub fn max_round(&self) -> Round {
        self.first_epoch_rounds
            .max_round()
            .into_iter()
            .chain(self.second_epoch_rounds.max_round())
            .max()
            .unwrap_or(0)
    }

    /// A certificate is relevant to round `r` iff it abandons `r - 1`.
    pub fn is_relevant_to(&self, round: Round) -> bool {
        round > 0 && self.round == round - 1
    }

    /// Validates the certificate. `committee_for` resolves the committee of
    /// each epoch signatures are drawn from; the weight threshold is
    /// checked against the newest such committee.
    pub fn verify<'a, F>(
        &self,
        genesis: &BlockHash,
        threshold: SignatureThreshold,
        committee_for: F,
    ) -> Result<(), CertificateError>
    where
        F: Fn(Epoch) -> Option<&'a FinalizationCommittee>,
    {
        if self.first_epoch_rounds.is_empty() {
            return Err(CertificateError::Malformed(
                "timeout certificate with empty first epoch",
            ));
        }
        let first_committee = self
            .committee(self.min_epoch, &committee_for)?;
        let newest_committee = self.committee(self.max_epoch(), &committee_for)?;

        // Weight: the union of signing bakers measured in the newest
        // committee, so seats that persist across the epoch boundary are
        // not double counted.
        let mut signed_weight = 0u64;
        let mut counted = FinalizerSet::empty();
        let epochs = [
            (&self.first_epoch_rounds, first_committee),
            (&self.second_epoch_rounds, newest_committee),
        ];
        for (rounds, committee) in &epochs {
            for index in rounds.all_finalizers().iter() {
                let info = committee
                    .finalizer(index)
                    .ok_or(CertificateError::UnknownFinalizer(index))?;
                if let Some(seat) = newest_committee.finalizer_by_baker(info.baker_id) {
                    if !counted.contains(seat.index) {
                        counted.insert(seat.index);
                        signed_weight += seat.weight;
                    }
                }
            }
        }
        if !threshold.met_by(signed_weight, newest_committee.total_weight()) {
            return Err(CertificateError::InsufficientWeight);
        }

        // Signature: one message per (epoch, witnessed qc round), repeated
        // per signer of that group.
        let mut messages: Vec<Vec<u8>> = Vec::new();
        let mut groups: Vec<(usize, &FinalizerSet, &FinalizationCommittee)> = Vec::new();
        for (epoch_offset, &(rounds, committee)) in epochs.iter().enumerate() {
            let epoch = self.min_epoch + epoch_offset as Epoch;
            for (qc_round, signers) in rounds.iter() {
                let message = TimeoutSignatureMessage {
                    genesis,
                    round: self.round,
                    qc_round: *qc_round,
                    qc_epoch: epoch,
                };
                messages.push(message.signing_bytes());
                groups.push((messages.len() - 1, signers, committee));
            }
        }
        let mut pairs: Vec<(&[u8], &kestrel_crypto::bls::BlsPublicKey)> = Vec::new();
        for (message_index, signers, committee) in groups {
            for index in signers.iter() {
                let info = committee
                    .finalizer(index)
                    .ok_or(CertificateError::UnknownFinalizer(index))?;
                pairs.push((&messages[message_index], &info.aggregation_key));
            }
        }
        self.aggregate_signature
            .verify_aggregate_with_messages(&pairs)
            .map_err(|_| CertificateError::InvalidSignature)
    }

    fn committee<'a, F>(
        &self,
        epoch: Epoch,
        committee_for: &F,
    ) -> Result<&'a FinalizationCommittee, CertificateError>
    where
        F: Fn(Epoch) -> Option<&'a FinalizationCommittee>,
    {
        committee_for(epoch).ok_or(CertificateError::UnknownEpoch(epoch))
    }
}

impl fmt::Display for TimeoutCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TC(round: {}, epochs: {}..={})",
            self.round,
            self.min_epoch,
            self.max_epoch()
        )
    }
}
