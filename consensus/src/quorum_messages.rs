// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Reception and aggregation of the current round's quorum messages.
//!
//! The pool keeps one message per finalizer and an incremental
//! `(weight, aggregate, signer set)` accumulator per voted block, so
//! threshold detection after each insert is a single weight comparison.

use crate::block_storage::{BlockStatus, BlockTree};
use kestrel_consensus_types::{
    committee::FinalizationCommittee,
    common::{BlockHash, Epoch, FinalizerIndex, Round},
    finalizer_set::FinalizerSet,
    quorum_cert::QuorumCert,
    quorum_message::QuorumMessage,
};
use kestrel_crypto::bls::SignatureAggregator;
use std::collections::{BTreeMap, HashMap};

/// Why a quorum message was rejected. Double signing is additionally
/// surfaced as misbehaviour evidence by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumRejectReason {
    /// `message.round < current round`.
    ObsoleteRound,
    /// Signer index not seated in the epoch's committee.
    NotAFinalizer,
    /// BLS check over `(genesis, block, round, epoch)` failed.
    InvalidSignature,
    /// A different message from the same signer exists for this round.
    DoubleSigning,
    /// Message epoch does not match the current epoch.
    WrongEpoch,
}

/// A quorum message that passed reception checks and may be aggregated.
#[derive(Clone, Debug)]
pub struct VerifiedQuorumMessage(pub QuorumMessage);

/// Outcome of receiving a quorum message.
#[derive(Debug)]
pub enum ReceiveQuorumResult {
    /// Fresh, valid, block known live: process and relay.
    Received(VerifiedQuorumMessage),
    /// Fresh and valid, but the voted block is not alive here yet;
    /// process without relaying.
    ReceivedNoRelay(VerifiedQuorumMessage),
    Rejected(QuorumRejectReason),
    /// The message is ahead of us; the sender has state we lack.
    CatchupRequired,
    /// Byte-identical message already stored.
    Duplicate,
}

/// Incremental aggregation state for one voted block.
#[derive(Clone, Debug, Default)]
pub struct QuorumAccumulator {
    weight: u64,
    aggregator: SignatureAggregator,
    signatories: FinalizerSet,
}

impl QuorumAccumulator {
    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn signatories(&self) -> &FinalizerSet {
        &self.signatories
    }
}

/// The current round's quorum message pool.
pub struct QuorumMessagesPool {
    round: Round,
    by_finalizer: BTreeMap<FinalizerIndex, QuorumMessage>,
    accumulators: HashMap<BlockHash, QuorumAccumulator>,
}

impl QuorumMessagesPool {
    pub fn new(round: Round) -> Self {
        Self {
            round,
            by_finalizer: BTreeMap::new(),
            accumulators: HashMap::new(),
        }
    }

    pub fn round(&self) -> Round {
        self.round
    }

    /// Clears the pool for a new round.
    pub fn reset(&mut self, round: Round) {
        self.round = round;
        self.by_finalizer.clear();
        self.accumulators.clear();
    }

    pub fn message_from(&self, finalizer: FinalizerIndex) -> Option<&QuorumMessage> {
        self.by_finalizer.get(&finalizer)
    }

    pub fn messages(&self) -> impl Iterator<Item = &QuorumMessage> {
        self.by_finalizer.values()
    }

    /// Per-block signer sets, for catch-up status digests.
    pub fn signer_sets(&self) -> Vec<(BlockHash, FinalizerSet)> {
        self.accumulators
            .iter()
            .map(|(block, acc)| (*block, acc.signatories.clone()))
            .collect()
    }

    /// Validates `message` against the current round and committee.
    /// Performs no mutation; a `Received*` result must be followed by
    /// [`QuorumMessagesPool::add_verified`].
    pub fn receive(
        &self,
        message: &QuorumMessage,
        genesis: &BlockHash,
        current_round: Round,
        current_epoch: Epoch,
        committee: &FinalizationCommittee,
        tree: &BlockTree,
    ) -> ReceiveQuorumResult {
        debug_assert_eq!(self.round, current_round);
        if message.round < current_round {
            return ReceiveQuorumResult::Rejected(QuorumRejectReason::ObsoleteRound);
        }
        if message.round > current_round || message.epoch > current_epoch {
            return ReceiveQuorumResult::CatchupRequired;
        }
        if message.epoch < current_epoch {
            return ReceiveQuorumResult::Rejected(QuorumRejectReason::WrongEpoch);
        }
        let info = match committee.finalizer(message.finalizer) {
            Some(info) => info,
            None => return ReceiveQuorumResult::Rejected(QuorumRejectReason::NotAFinalizer),
        };
        if let Some(existing) = self.by_finalizer.get(&message.finalizer) {
            return if existing == message {
                ReceiveQuorumResult::Duplicate
            } else {
                ReceiveQuorumResult::Rejected(QuorumRejectReason::DoubleSigning)
            };
        }
        if message.verify(genesis, &info.aggregation_key).is_err() {
            return ReceiveQuorumResult::Rejected(QuorumRejectReason::InvalidSignature);
        }
        let verified = VerifiedQuorumMessage(message.clone());
        match tree.block_status(&message.block) {
            BlockStatus::Alive(_) | BlockStatus::Finalized(_) => {
                ReceiveQuorumResult::Received(verified)
            }
            _ => ReceiveQuorumResult::ReceivedNoRelay(verified),
        }
    }

    /// Folds a verified message into the pool and returns the accumulator
    /// for its block after the insert.
    pub fn add_verified(
        &mut self,
        message: VerifiedQuorumMessage,
        weight: u64,
    ) -> &QuorumAccumulator {
        let VerifiedQuorumMessage(message) = message;
        let block = message.block;
        let accumulator = self.accumulators.entry(block).or_default();
        accumulator.weight += weight;
        accumulator.aggregator.add(&message.signature);
        accumulator.signatories.insert(message.finalizer);
        self.by_finalizer.insert(message.finalizer, message);
        self.accumulators
            .get(&block)
            .expect("accumulator just inserted")
    }

    /// Builds the certificate for `block` from the accumulated state.
    pub fn certificate_for(
        &self,
        block: &BlockHash,
        round: Round,
        epoch: Epoch,
    ) -> Option<QuorumCert> {
        let accumulator = self.accumulators.get(block)?;
        Some(QuorumCert::new(
            *block,
            round,
            epoch,
            accumulator.aggregator.finish(),
            accumulator.signatories.clone(),
        ))
    }
}
