// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Reception and aggregation of timeout messages.
//!
//! Honest timeout messages for one round cluster within two consecutive
//! epochs of the receiver's view, so the pool is exactly two buckets with
//! constant-time rotation rather than a general ring.

use crate::block_storage::{BlockStatus, BlockTree};
use kestrel_consensus_types::{
    committee::FinalizationCommittee,
    common::{BlockHash, Epoch, FinalizerIndex, Round},
    finalizer_set::FinalizerSet,
    timeout_cert::{FinalizerRounds, TimeoutCert},
    timeout_message::TimeoutMessage,
};
use kestrel_crypto::bls::SignatureAggregator;
use std::{collections::BTreeMap, sync::Arc};

/// Why a timeout message was rejected. Listed in validation order; later
/// reasons assume the earlier checks held.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutRejectReason {
    /// `message.round < current round`.
    ObsoleteRound,
    /// Embedded certificate is for a round or epoch below the last
    /// finalized block.
    ObsoleteQC,
    /// Signer index not seated in the message epoch's committee.
    NotAFinalizer,
    /// Ed25519 envelope check failed.
    InvalidSignature,
    /// A different timeout message from this signer exists for the round;
    /// surfaced as evidence.
    DoubleSigning,
    /// Embedded certificate names a block finalized before the last
    /// finalized block.
    ObsoleteQCPointer,
    /// Embedded certificate names a dead block.
    DeadQCPointer,
    /// BLS check on the timeout payload failed.
    InvalidBLSSignature,
}

/// A timeout message that passed reception, paired with the committee
/// resolved for its embedded certificate's epoch. The caller must execute
/// it immediately, before any other state mutation.
#[derive(Clone, Debug)]
pub struct PartiallyVerifiedTimeoutMessage {
    pub message: TimeoutMessage,
    pub qc_committee: Arc<FinalizationCommittee>,
}

#[derive(Debug)]
pub enum ReceiveTimeoutResult {
    Received(Box<PartiallyVerifiedTimeoutMessage>),
    Rejected(TimeoutRejectReason),
    CatchupRequired,
    /// Byte-identical message already stored.
    Duplicate,
}

/// The two-epoch sliding window of stored timeout messages.
#[derive(Clone, Debug)]
pub struct TimeoutMessagesWindow {
    first_epoch: Epoch,
    first_epoch_timeouts: BTreeMap<FinalizerIndex, TimeoutMessage>,
    second_epoch_timeouts: BTreeMap<FinalizerIndex, TimeoutMessage>,
}

/// Outcome of inserting into the window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Message epoch predates the window and cannot be accommodated.
    TooOld,
}

impl TimeoutMessagesWindow {
    pub fn new(message: TimeoutMessage) -> Self {
        Self {
            first_epoch: message.epoch(),
            first_epoch_timeouts: BTreeMap::from([(message.finalizer(), message)]),
            second_epoch_timeouts: BTreeMap::new(),
        }
    }

    pub fn first_epoch(&self) -> Epoch {
        self.first_epoch
    }

    pub fn first_epoch_timeouts(&self) -> impl Iterator<Item = &TimeoutMessage> {
        self.first_epoch_timeouts.values()
    }

    pub fn second_epoch_timeouts(&self) -> impl Iterator<Item = &TimeoutMessage> {
        self.second_epoch_timeouts.values()
    }

    /// The stored message from `finalizer`, newest bucket first.
    pub fn message_from(&self, finalizer: FinalizerIndex) -> Option<&TimeoutMessage> {
        self.second_epoch_timeouts
            .get(&finalizer)
            .or_else(|| self.first_epoch_timeouts.get(&finalizer))
    }

    /// Finalizer sets per bucket, for catch-up status digests.
    pub fn signer_summary(&self) -> (Epoch, FinalizerSet, FinalizerSet) {
        (
            self.first_epoch,
            self.first_epoch_timeouts.keys().copied().collect(),
            self.second_epoch_timeouts.keys().copied().collect(),
        )
    }

    /// Inserts `message` following the rotation rules; see module docs.
    pub fn insert(&mut self, message: TimeoutMessage) -> InsertOutcome {
        let epoch = message.epoch();
        let first = self.first_epoch;
        if epoch == first {
            self.first_epoch_timeouts.insert(message.finalizer(), message);
        } else if epoch == first + 1 {
            self.second_epoch_timeouts.insert(message.finalizer(), message);
        } else if epoch == first + 2 && !self.second_epoch_timeouts.is_empty() {
            // Rotate left: drop the old first epoch, shift the second
            // down, open a fresh second bucket.
            self.first_epoch = first + 1;
            self.first_epoch_timeouts = std::mem::take(&mut self.second_epoch_timeouts);
            self.second_epoch_timeouts = BTreeMap::from([(message.finalizer(), message)]);
        } else if epoch >= first + 2 {
            // Rotation alone cannot accommodate it; restart the window.
            *self = Self::new(message);
        } else if epoch + 1 == first && self.second_epoch_timeouts.is_empty() {
            // Rotate right: prepend a new first epoch.
            self.first_epoch = epoch;
            self.second_epoch_timeouts = std::mem::take(&mut self.first_epoch_timeouts);
            self.first_epoch_timeouts = BTreeMap::from([(message.finalizer(), message)]);
        } else {
            return InsertOutcome::TooOld;
        }
        InsertOutcome::Inserted
    }

    /// All stored messages for `round`, bucketed by epoch offset.
    fn messages_for_round(
        &self,
        round: Round,
    ) -> (Vec<&TimeoutMessage>, Vec<&TimeoutMessage>) {
        let first: Vec<&TimeoutMessage> = self
            .first_epoch_timeouts
            .values()
            .filter(|m| m.round() == round)
            .collect();
        let second: Vec<&TimeoutMessage> = self
            .second_epoch_timeouts
            .values()
            .filter(|m| m.round() == round)
            .collect();
        (first, second)
    }

    /// The bakers who signed a timeout for `round`, as seats of
    /// `committee` (the embedded certificate's epoch committee), and their
    /// combined weight there.
    pub fn signed_weight_for(
        &self,
        round: Round,
        committee: &FinalizationCommittee,
    ) -> u64 {
        let (first, second) = self.messages_for_round(round);
        let mut counted = FinalizerSet::empty();
        let mut weight = 0u64;
        for message in first.iter().chain(second.iter()) {
            // Seats are resolved through the message's own bucket, but
            // everything is weighed in the one committee.
            if let Some(seat) = committee.finalizer(message.finalizer()) {
                if !counted.contains(seat.index) {
                    counted.insert(seat.index);
                    weight += seat.weight;
                }
            }
        }
        weight
    }

    /// Builds the timeout certificate for `round` from the stored
    /// messages: per epoch, signers grouped by the certified round they
    /// witnessed; one aggregate over every contained signature.
    pub fn certificate_for(&self, round: Round) -> TimeoutCert {
        let (first, second) = self.messages_for_round(round);
        let mut aggregator = SignatureAggregator::new();
        let mut group = |messages: &[&TimeoutMessage]| {
            let mut rounds: BTreeMap<Round, FinalizerSet> = BTreeMap::new();
            for message in messages {
                rounds
                    .entry(message.quorum_cert().round())
                    .or_default()
                    .insert(message.finalizer());
                aggregator.add(&message.body.aggregate_part);
            }
            FinalizerRounds(rounds)
        };
        let first_epoch_rounds = group(&first);
        let second_epoch_rounds = group(&second);
        TimeoutCert::new(
            round,
            self.first_epoch,
            first_epoch_rounds,
            second_epoch_rounds,
            aggregator.finish(),
        )
    }
}

/// Validation context for incoming timeout messages.
pub struct TimeoutReceiveContext<'a> {
    pub genesis: &'a BlockHash,
    pub current_round: Round,
    pub current_epoch: Epoch,
    pub last_finalized_round: Round,
    pub last_finalized_epoch: Epoch,
    pub last_finalized_hash: BlockHash,
    /// Committee resolver for the retained epoch window.
    pub committee_for: &'a dyn Fn(Epoch) -> Option<Arc<FinalizationCommittee>>,
}

/// Validates `message` without mutating any state. A `Received` result
/// must be fed to the round manager's execute step immediately.
pub fn receive_timeout_message(
    message: &TimeoutMessage,
    window: Option<&TimeoutMessagesWindow>,
    tree: &BlockTree,
    ctx: &TimeoutReceiveContext<'_>,
) -> ReceiveTimeoutResult {
    use ReceiveTimeoutResult::*;
    use TimeoutRejectReason::*;

    if message.round() < ctx.current_round {
        return Rejected(ObsoleteRound);
    }
    let qc = message.quorum_cert();
    if qc.epoch() < ctx.last_finalized_epoch || qc.round() < ctx.last_finalized_round {
        return Rejected(ObsoleteQC);
    }
    if message.epoch() > ctx.current_epoch {
        return CatchupRequired;
    }
    let qc_block_status = tree.block_status(&qc.block());
    if matches!(
        qc_block_status,
        BlockStatus::Unknown | BlockStatus::Pending(_)
    ) && qc.block() != ctx.last_finalized_hash
    {
        return CatchupRequired;
    }
    if message.round() > ctx.current_round && qc.round() + 1 < message.round() {
        return CatchupRequired;
    }
    let committee = match (ctx.committee_for)(message.epoch()) {
        Some(committee) => committee,
        None => return Rejected(NotAFinalizer),
    };
    let info = match committee.finalizer(message.finalizer()) {
        Some(info) => info.clone(),
        None => return Rejected(NotAFinalizer),
    };
    if message.verify_envelope(&info.sign_key).is_err() {
        return Rejected(InvalidSignature);
    }
    if let Some(stored) = window.and_then(|w| w.message_from(message.finalizer())) {
        if stored.round() == message.round() && stored != message {
            return Rejected(DoubleSigning);
        }
    }
    match qc_block_status {
        BlockStatus::Finalized(pointer) if pointer.hash() != ctx.last_finalized_hash => {
            return Rejected(ObsoleteQCPointer);
        }
        BlockStatus::Dead => return Rejected(DeadQCPointer),
        _ => {}
    }
    if message
        .verify_aggregate_part(ctx.genesis, &info.aggregation_key)
        .is_err()
    {
        return Rejected(InvalidBLSSignature);
    }
    if let Some(stored) = window.and_then(|w| w.message_from(message.finalizer())) {
        if stored == message {
            return Duplicate;
        }
    }
    let qc_committee = match (ctx.committee_for)(qc.epoch()) {
        Some(committee) => committee,
        None => return CatchupRequired,
    };
    Received(Box::new(PartiallyVerifiedTimeoutMessage {
        message: message.clone(),
        qc_committee,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestSetup;
    use kestrel_consensus_types::quorum_cert::QuorumCert;

    fn message(setup: &TestSetup, finalizer: u32, round: Round, epoch: Epoch) -> TimeoutMessage {
        setup.timeout_message(finalizer, round, epoch, QuorumCert::genesis(setup.genesis_hash))
    }

    #[test]
    fn window_fills_two_consecutive_epochs() {
        let setup = TestSetup::new(4);
        let mut window = TimeoutMessagesWindow::new(message(&setup, 0, 9, 4));
        assert_eq!(window.first_epoch(), 4);

        assert_eq!(window.insert(message(&setup, 1, 9, 4)), InsertOutcome::Inserted);
        assert_eq!(window.insert(message(&setup, 2, 9, 5)), InsertOutcome::Inserted);
        let (first_epoch, first, second) = window.signer_summary();
        assert_eq!(first_epoch, 4);
        assert_eq!(first.iter().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(second.iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn boundary_epoch_rotates_iff_second_bucket_nonempty() {
        let setup = TestSetup::new(4);

        // Second bucket populated: rotate left.
        let mut window = TimeoutMessagesWindow::new(message(&setup, 0, 9, 4));
        window.insert(message(&setup, 1, 9, 5));
        assert_eq!(window.insert(message(&setup, 2, 9, 6)), InsertOutcome::Inserted);
        let (first_epoch, first, second) = window.signer_summary();
        assert_eq!(first_epoch, 5);
        assert_eq!(first.iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(second.iter().collect::<Vec<_>>(), vec![2]);

        // Second bucket empty: the window restarts at the new epoch.
        let mut window = TimeoutMessagesWindow::new(message(&setup, 0, 9, 4));
        assert_eq!(window.insert(message(&setup, 2, 9, 6)), InsertOutcome::Inserted);
        let (first_epoch, first, second) = window.signer_summary();
        assert_eq!(first_epoch, 6);
        assert_eq!(first.iter().collect::<Vec<_>>(), vec![2]);
        assert!(second.is_empty());
    }

    #[test]
    fn window_rotates_right_when_second_bucket_empty() {
        let setup = TestSetup::new(4);
        let mut window = TimeoutMessagesWindow::new(message(&setup, 0, 9, 4));
        assert_eq!(window.insert(message(&setup, 1, 9, 3)), InsertOutcome::Inserted);
        let (first_epoch, first, second) = window.signer_summary();
        assert_eq!(first_epoch, 3);
        assert_eq!(first.iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(second.iter().collect::<Vec<_>>(), vec![0]);

        // With the second bucket occupied, older epochs cannot enter.
        assert_eq!(window.insert(message(&setup, 2, 9, 2)), InsertOutcome::TooOld);
    }

    #[test]
    fn certificate_groups_by_witnessed_round_and_verifies() {
        let setup = TestSetup::new(4);
        let qc_low = QuorumCert::genesis(setup.genesis_hash);
        let mut window =
            TimeoutMessagesWindow::new(setup.timeout_message(0, 9, 0, qc_low.clone()));
        window.insert(setup.timeout_message(1, 9, 0, qc_low.clone()));
        window.insert(setup.timeout_message(2, 9, 0, qc_low));

        assert_eq!(window.signed_weight_for(9, setup.committee()), 3);
        let cert = window.certificate_for(9);
        assert_eq!(cert.round(), 9);
        assert_eq!(cert.min_epoch(), 0);
        assert_eq!(cert.max_epoch(), 0);
        assert_eq!(cert.max_round(), 0);
        let signers = cert
            .first_epoch_rounds()
            .iter()
            .map(|(round, set)| (*round, set.len()))
            .collect::<Vec<_>>();
        assert_eq!(signers, vec![(0, 3)]);
        assert!(cert
            .verify(&setup.genesis_hash, setup.threshold(), |epoch| {
                (epoch == 0).then_some(setup.committee())
            })
            .is_ok());
    }

    #[test]
    fn stale_rounds_do_not_contribute_to_certificates() {
        let setup = TestSetup::new(4);
        let mut window = TimeoutMessagesWindow::new(message(&setup, 0, 8, 0));
        window.insert(message(&setup, 1, 9, 0));
        window.insert(message(&setup, 2, 9, 0));

        assert_eq!(window.signed_weight_for(9, setup.committee()), 2);
        let cert = window.certificate_for(9);
        let total: usize = cert
            .first_epoch_rounds()
            .iter()
            .map(|(_, set)| set.len())
            .sum();
        assert_eq!(total, 2);
    }
}
