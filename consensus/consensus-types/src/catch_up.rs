// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Wire types for the catch-up protocol: a compact digest of a node's tree
//! and round state, and the terminal data closing a response stream.

use crate::{
    common::{BlockHash, Epoch, Round},
    finalizer_set::FinalizerSet,
    quorum_cert::QuorumCert,
    quorum_message::QuorumMessage,
    timeout_cert::TimeoutCert,
    timeout_message::TimeoutMessage,
};
use serde::{Deserialize, Serialize};

/// Which finalizers have timeout messages stored for the current round, by
/// epoch bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpTimeoutSummary {
    pub first_epoch: Epoch,
    pub first_epoch_finalizers: FinalizerSet,
    pub second_epoch_finalizers: FinalizerSet,
}

/// A compact digest of one node's view of the tree and the current round,
/// exchanged to decide who is behind and what to send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpStatus {
    pub last_finalized_block: BlockHash,
    pub last_finalized_round: Round,
    /// Alive blocks with no alive child. Empty in lightweight status
    /// messages.
    pub leaves: Vec<BlockHash>,
    /// Alive non-leaf, non-finalized blocks. Empty in lightweight status
    /// messages.
    pub branches: Vec<BlockHash>,
    pub current_round: Round,
    pub current_epoch: Epoch,
    /// Per-block signer sets of the current round's quorum messages.
    pub quorum_signers: Vec<(BlockHash, FinalizerSet)>,
    pub timeout_summary: Option<CatchUpTimeoutSummary>,
}

impl CatchUpStatus {
    pub fn knows_block(&self, hash: &BlockHash) -> bool {
        self.last_finalized_block == *hash
            || self.leaves.contains(hash)
            || self.branches.contains(hash)
    }

    /// Signers of quorum messages for `block` on the peer's side.
    pub fn quorum_signers_for(&self, block: &BlockHash) -> Option<&FinalizerSet> {
        self.quorum_signers
            .iter()
            .find(|(hash, _)| hash == block)
            .map(|(_, set)| set)
    }
}

/// The data record terminating a catch-up response stream. Processed in
/// field order: certificates first, then the unaggregated votes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpTerminalData {
    /// The highest quorum certificate, preceded by the certificate that
    /// last advanced finality when that is a different one.
    pub quorum_certs: Vec<QuorumCert>,
    /// Certificate for the round before the receiver's current round, when
    /// the receiver is behind.
    pub timeout_cert: Option<TimeoutCert>,
    /// Current-round quorum messages the receiver is missing.
    pub quorum_messages: Vec<QuorumMessage>,
    /// Current-round timeout messages the receiver is missing.
    pub timeout_messages: Vec<TimeoutMessage>,
}

impl CatchUpTerminalData {
    pub fn is_empty(&self) -> bool {
        self.quorum_certs.is_empty()
            && self.timeout_cert.is_none()
            && self.quorum_messages.is_empty()
            && self.timeout_messages.is_empty()
    }
}

/// Catch-up wire messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatchUpMessage {
    /// Lightweight digest with no leaves/branches, broadcast to let peers
    /// notice they are behind.
    Status(Box<CatchUpStatus>),
    /// Full digest asking the receiver to respond with missing blocks.
    Request(Box<CatchUpStatus>),
    /// Stream terminator, carrying terminal data unless the responder had
    /// nothing to add.
    Response(Option<Box<CatchUpTerminalData>>),
}
