// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    block_storage::BlockPointer,
    state_replication::{ExecutionError, PayloadProvider, StateComputer},
};
use kestrel_consensus_types::{
    block::{BlockData, SignedBlock},
    common::{BlockHash, Epoch, Round, Timestamp},
    finalization_entry::FinalizationEntry,
    quorum_cert::QuorumCert,
    signer::ConsensusSigner,
    timeout_cert::TimeoutCert,
};
use kestrel_crypto::vrf::VrfProofValue;
use std::sync::Arc;
use tracing::debug;

/// Assembles and signs the local baker's proposal for a round whose
/// lottery it won. The round manager establishes the win and passes the
/// proof in; at most one proposal is generated per round since the only
/// caller is the round-entry path.
pub struct ProposalGenerator {
    signer: ConsensusSigner,
    genesis_hash: BlockHash,
}

impl ProposalGenerator {
    pub fn new(signer: ConsensusSigner, genesis_hash: BlockHash) -> Self {
        Self {
            signer,
            genesis_hash,
        }
    }

    pub fn signer(&self) -> &ConsensusSigner {
        &self.signer
    }

    pub fn genesis_hash(&self) -> &BlockHash {
        &self.genesis_hash
    }

    /// Builds the block for `round` on top of `parent`: pulls the payload,
    /// executes it to learn the claimed hashes, embeds the winning
    /// leadership proof as the block nonce and signs.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_proposal(
        &self,
        round: Round,
        epoch: Epoch,
        block_nonce: VrfProofValue,
        parent: &Arc<BlockPointer>,
        parent_qc: QuorumCert,
        timeout_cert: Option<TimeoutCert>,
        epoch_finalization_entry: Option<FinalizationEntry>,
        payload: &dyn PayloadProvider,
        execution: &dyn StateComputer,
        now: Timestamp,
    ) -> Result<SignedBlock, ExecutionError> {
        debug_assert_eq!(parent_qc.block(), parent.hash());
        // Timestamps are strictly monotone along a chain.
        let timestamp = now.max(parent.timestamp() + 1);
        let transactions = payload.get_payload(&parent.hash());
        let executed = execution.execute(&parent.state_hash(), round, timestamp, &transactions)?;
        let data = BlockData {
            round,
            epoch,
            timestamp,
            baker_id: self.signer.baker_id(),
            parent: parent.hash(),
            quorum_cert: parent_qc,
            timeout_cert,
            epoch_finalization_entry,
            block_nonce,
            transactions,
            state_hash: executed.state_hash,
            outcomes_hash: executed.outcomes_hash,
        };
        let block = SignedBlock::sign(data, self.signer.block_key());
        debug!(block = %block, "generated proposal");
        Ok(block)
    }
}
