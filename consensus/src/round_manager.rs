// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! The consensus engine proper: one value owning the tree, the round
//! status, the vote pools and the capability bundle, processing one event
//! at a time.
//!
//! Every public `process_*`/`receive_*` entry point runs to completion on
//! the single consensus context; the async event loop only sequences
//! them. Round-status durability happens inside the mutating helpers, so
//! by the time a broadcast goes out the state it derives from is on disk.

use crate::{
    block_storage::{BlockPointer, BlockStatus, BlockStore, RecentBlockStatus},
    config::ConsensusConfig,
    counters,
    epoch_state::EpochCommittees,
    evidence::{Misbehaviour, MisbehaviourHandler},
    finality,
    liveness::{
        leader_election,
        proposal_generator::ProposalGenerator,
        round_state::{AdvanceCause, NewRoundEvent, RoundState},
    },
    network::{BroadcastSender, ConsensusMsg},
    persistent_storage::{PersistentStorage, StorageResult, StoredBlock},
    quorum_messages::{QuorumMessagesPool, QuorumRejectReason, ReceiveQuorumResult},
    state_replication::{PayloadProvider, StateComputer},
    timeout_messages::{
        receive_timeout_message, InsertOutcome, PartiallyVerifiedTimeoutMessage,
        ReceiveTimeoutResult, TimeoutMessagesWindow, TimeoutReceiveContext, TimeoutRejectReason,
    },
    timer::{RoundTimeoutEvent, TimeService},
    UpdateResult,
};
use anyhow::{bail, Context};
use kestrel_consensus_types::{
    block::SignedBlock,
    catch_up::CatchUpMessage,
    committee::FinalizationCommittee,
    common::{BlockHash, Epoch, Round},
    genesis::GenesisConfiguration,
    quorum_cert::QuorumCert,
    quorum_message::QuorumMessage,
    signer::ConsensusSigner,
    timeout_message::TimeoutMessage,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "round_manager_test.rs"]
mod round_manager_test;

/// The capability bundle the engine runs against; concrete
/// implementations are selected at wiring time.
pub struct ConsensusContext {
    pub execution: Arc<dyn StateComputer>,
    pub payload: Arc<dyn PayloadProvider>,
    pub network: Arc<dyn BroadcastSender>,
    pub time: Arc<dyn TimeService>,
    pub misbehaviour: Arc<dyn MisbehaviourHandler>,
}

/// External inputs delivered into the consensus context.
#[derive(Debug)]
pub enum ConsensusEvent {
    Block(Box<SignedBlock>),
    QuorumMessage(Box<QuorumMessage>),
    TimeoutMessage(Box<TimeoutMessage>),
    CatchUpStatus(Box<kestrel_consensus_types::catch_up::CatchUpStatus>),
    Shutdown,
}

pub struct RoundManager {
    pub(crate) config: ConsensusConfig,
    pub(crate) genesis: GenesisConfiguration,
    pub(crate) genesis_hash: BlockHash,
    pub(crate) store: BlockStore,
    pub(crate) round_state: RoundState,
    pub(crate) epochs: EpochCommittees,
    pub(crate) quorum_pool: QuorumMessagesPool,
    pub(crate) timeout_window: Option<TimeoutMessagesWindow>,
    /// Round → epoch of every verified certificate seen, pruned below the
    /// finalized round; cross-checks certificates smuggled in timeout
    /// messages.
    pub(crate) qc_witnesses: BTreeMap<Round, Epoch>,
    pub(crate) proposal_generator: Option<ProposalGenerator>,
    pub(crate) execution: Arc<dyn StateComputer>,
    pub(crate) payload: Arc<dyn PayloadProvider>,
    pub(crate) network: Arc<dyn BroadcastSender>,
    pub(crate) time: Arc<dyn TimeService>,
    pub(crate) misbehaviour: Arc<dyn MisbehaviourHandler>,
    pub(crate) is_shut_down: bool,
    /// Set while terminal catch-up data is applied: rounds may advance but
    /// block production is deferred until the batch completes.
    pub(crate) defer_block_production: bool,
}

impl RoundManager {
    /// Opens the engine over `storage`: seeds or validates the genesis
    /// records, restores the round status and epoch window, and rebuilds
    /// the tree rooted at the last finalized block.
    pub fn open(
        config: ConsensusConfig,
        genesis: GenesisConfiguration,
        storage: Arc<PersistentStorage>,
        context: ConsensusContext,
        signer: Option<ConsensusSigner>,
    ) -> anyhow::Result<Self> {
        let genesis_hash = genesis.hash();
        storage.init_genesis(&genesis_hash)?;

        let root = match storage.last_finalized_block()? {
            Some(stored) => stored.into_pointer(),
            None => {
                let stored = StoredBlock::Genesis {
                    hash: genesis_hash,
                    timestamp: genesis.parameters.timestamp,
                    state_hash: genesis.initial_state_hash(),
                };
                storage.write_genesis_block(&stored)?;
                stored.into_pointer()
            }
        };
        let tree = BlockTree::new(
            root,
            config.dead_cache_size,
            config.recent_finalized_in_mem,
        );
        let store = BlockStore::new(tree, storage.clone());

        let round_state = RoundState::recover_or_init(
            storage.clone(),
            QuorumCert::genesis(genesis_hash),
            genesis.parameters.base_timeout_ms,
        )?;

        let mut epochs = EpochCommittees::new(&genesis);
        let current_epoch = round_state.current_epoch();
        for epoch in current_epoch.saturating_sub(2).max(1)..=current_epoch {
            match storage.epoch_nonce(epoch)? {
                Some(nonce) => epochs.restore(epoch, nonce),
                None => bail!("missing persisted leadership nonce for epoch {epoch}"),
            }
        }

        let mut qc_witnesses = BTreeMap::new();
        let highest = round_state.highest_certified();
        if !highest.is_genesis() {
            qc_witnesses.insert(highest.round(), highest.epoch());
        }

        let quorum_pool = QuorumMessagesPool::new(round_state.current_round());
        let proposal_generator =
            signer.map(|signer| ProposalGenerator::new(signer, genesis_hash));

        let manager = Self {
            config,
            genesis,
            genesis_hash,
            store,
            round_state,
            epochs,
            quorum_pool,
            timeout_window: None,
            qc_witnesses,
            proposal_generator,
            execution: context.execution,
            payload: context.payload,
            network: context.network,
            time: context.time,
            misbehaviour: context.misbehaviour,
            is_shut_down: false,
            defer_block_production: false,
        };
        manager.arm_round_timer();
        info!(
            round = manager.round_state.current_round(),
            epoch = manager.round_state.current_epoch(),
            last_finalized = %manager.store.tree().last_finalized().hash().short_str(),
            "consensus engine opened"
        );
        Ok(manager)
    }

    /// Stops processing new messages; the engine answers queries only.
    pub fn shutdown(&mut self) {
        self.is_shut_down = true;
        info!("consensus engine shut down");
    }

    /// Flushes the stores; pairs with [`RoundManager::open`].
    pub fn close(&mut self) -> StorageResult<()> {
        self.shutdown();
        self.store.storage().close()
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down
    }

    pub fn current_round(&self) -> Round {
        self.round_state.current_round()
    }

    pub fn current_epoch(&self) -> Epoch {
        self.round_state.current_epoch()
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.store
    }

    /// Sequences external inputs into the single consensus context.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ConsensusEvent>,
        mut timeouts: mpsc::UnboundedReceiver<RoundTimeoutEvent>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => match event {
                    ConsensusEvent::Block(block) => {
                        self.receive_block(Arc::new(*block));
                    }
                    ConsensusEvent::QuorumMessage(message) => {
                        self.process_quorum_message(*message);
                    }
                    ConsensusEvent::TimeoutMessage(message) => {
                        self.process_timeout_message(*message);
                    }
                    ConsensusEvent::CatchUpStatus(status) => {
                        if !self.is_shut_down
                            && crate::catchup::is_catch_up_required(&status, &self)
                        {
                            let request = crate::catchup::make_status(&self, false);
                            self.network.broadcast(ConsensusMsg::CatchUp(Box::new(
                                CatchUpMessage::Request(Box::new(request)),
                            )));
                        }
                    }
                    ConsensusEvent::Shutdown => {
                        if let Err(e) = self.close() {
                            error!(error = %e, "error closing consensus stores");
                        }
                        return;
                    }
                },
                Some(event) = timeouts.recv() => {
                    self.upon_timeout_event(event);
                },
                else => return,
            }
        }
    }

    // ---------------------------------------------------------------
    // Block processing
    // ---------------------------------------------------------------

    /// Receives, verifies, executes and integrates a signed block,
    /// then runs any pending children that were waiting for it.
    pub fn receive_block(&mut self, block: Arc<SignedBlock>) -> UpdateResult {
        if self.is_shut_down {
            return UpdateResult::ConsensusShutDown;
        }
        let now = self.time.now();
        if block.timestamp() > now + self.config.early_block_threshold_ms {
            debug!(block = %block, "rejecting early block");
            return UpdateResult::EarlyBlock;
        }
        let result = self.receive_block_known_time(block);
        self.drain_pending_until_current();
        result
    }

    fn receive_block_known_time(&mut self, block: Arc<SignedBlock>) -> UpdateResult {
        let hash = block.hash();
        match self.store.get_recent_block_status(&hash) {
            Ok(RecentBlockStatus::Recent(BlockStatus::Unknown)) => {}
            Ok(_) => return UpdateResult::Duplicate,
            Err(e) => return self.fatal(e),
        }
        let last_finalized = self.store.tree().last_finalized().clone();
        if block.timestamp() <= last_finalized.timestamp()
            || block.round() <= last_finalized.round()
        {
            self.mark_block_dead(&hash, "stale");
            return UpdateResult::Stale;
        }

        let parent_hash = block.parent();
        let parent_status = match self.store.get_recent_block_status(&parent_hash) {
            Ok(status) => status,
            Err(e) => return self.fatal(e),
        };
        match parent_status {
            RecentBlockStatus::Recent(BlockStatus::Unknown)
            | RecentBlockStatus::Recent(BlockStatus::Pending(_)) => {
                self.receive_block_unknown_parent(block)
            }
            RecentBlockStatus::Recent(BlockStatus::Dead) => {
                self.mark_block_dead(&hash, "dead_parent");
                UpdateResult::Stale
            }
            RecentBlockStatus::OldFinalized => {
                self.mark_block_dead(&hash, "stale");
                UpdateResult::Stale
            }
            RecentBlockStatus::Recent(BlockStatus::Alive(parent))
            | RecentBlockStatus::Recent(BlockStatus::Finalized(parent)) => {
                match self.verify_and_insert_block(block, parent) {
                    Ok(result) => result,
                    Err(e) => {
                        error!(error = %e, "fatal error inserting block");
                        self.shutdown();
                        UpdateResult::ConsensusShutDown
                    }
                }
            }
        }
    }

    /// Cheap pre-checks for a block whose parent we do not have: the
    /// baker must exist, the signature must match the claimed key, and
    /// the proposer's leadership proof must win under the best nonce we
    /// can predict for the block's epoch.
    fn receive_block_unknown_parent(&mut self, block: Arc<SignedBlock>) -> UpdateResult {
        let hash = block.hash();
        let epoch = block.epoch();
        if epoch > self.current_epoch() + 1 {
            return UpdateResult::CatchupRequired;
        }
        let committee = match self.epochs.committee_arc_for(epoch.min(self.current_epoch())) {
            Some(committee) => committee,
            None => return UpdateResult::Unverifiable,
        };
        let baker = match committee.finalizer_by_baker(block.baker_id()) {
            Some(info) => info.clone(),
            None => {
                self.mark_block_dead(&hash, "unknown_baker");
                return UpdateResult::Invalid;
            }
        };
        if *block.signature_key() != baker.sign_key || block.verify_signature().is_err() {
            self.mark_block_dead(&hash, "bad_signature");
            return UpdateResult::Invalid;
        }
        let nonce = if epoch <= self.current_epoch() {
            self.epochs.leadership_nonce(epoch)
        } else {
            self.epochs.predicted_leadership_nonce(self.current_epoch())
        };
        let nonce = match nonce {
            Some(nonce) => nonce,
            None => return UpdateResult::Unverifiable,
        };
        if !leader_election::verify_leadership(&baker, &nonce, block.round(), block.block_nonce())
        {
            self.mark_block_dead(&hash, "lost_lottery");
            return UpdateResult::Invalid;
        }
        debug!(block = %block, "storing pending block");
        self.store.tree_mut().add_pending_block(block);
        UpdateResult::PendingBlock
    }

    /// Full verification against a live parent, then execution and
    /// insertion.
    fn verify_and_insert_block(
        &mut self,
        block: Arc<SignedBlock>,
        parent: Arc<BlockPointer>,
    ) -> anyhow::Result<UpdateResult> {
        let hash = block.hash();
        if let Err(reason) = self.verify_pending_block(&block, &parent) {
            debug!(block = %block, reason, "block failed verification");
            self.mark_block_dead(&hash, "invalid");
            return Ok(UpdateResult::Invalid);
        }

        // Certificates carried by a verified block may themselves advance
        // our view of the chain.
        let parent_qc = block.quorum_cert().clone();
        self.note_certificate(&parent_qc);
        if let Some(entry) = block.epoch_finalization_entry() {
            if block.epoch() == self.current_epoch() + 1 {
                self.apply_epoch_transition(block.epoch(), entry.clone())?;
            }
        }

        let executed = match self.execution.execute(
            &parent.state_hash(),
            block.round(),
            block.timestamp(),
            block.transactions(),
        ) {
            Ok(executed) => executed,
            Err(e) => {
                debug!(block = %block, error = %e, "block execution failed");
                self.mark_block_dead(&hash, "execution_failed");
                return Ok(UpdateResult::Invalid);
            }
        };
        if executed.state_hash != block.state_hash()
            || executed.outcomes_hash != block.outcomes_hash()
        {
            debug!(block = %block, "block execution hashes do not match claims");
            self.mark_block_dead(&hash, "execution_mismatch");
            return Ok(UpdateResult::Invalid);
        }

        let arrive_time = self.time.now();
        let pointer = self.store.tree_mut().make_live(
            block.clone(),
            &parent,
            executed.state_hash,
            arrive_time,
        );
        debug!(block = %pointer.hash().short_str(), height = pointer.height(), "block is live");

        finality::check_finality(&mut self.store, self.payload.as_ref(), &parent_qc)?;
        self.maybe_trigger_epoch_transition()?;

        // Round advancement from the block's certificates.
        if self.current_round() <= parent_qc.round() {
            let _ = self.round_state.update_highest_certified(parent_qc.clone())?;
            let event = self
                .round_state
                .advance_round(parent_qc.round() + 1, AdvanceCause::Quorum(parent_qc.clone()))?;
            self.process_new_round_event(event)?;
        } else {
            let _ = self.round_state.update_highest_certified(parent_qc.clone())?;
        }
        if let Some(tc) = block.timeout_cert() {
            if self.current_round() <= tc.round() {
                let highest = self.round_state.highest_certified().clone();
                let event = self.round_state.advance_round(
                    tc.round() + 1,
                    AdvanceCause::Timeout {
                        cert: tc.clone(),
                        highest_qc: highest,
                    },
                )?;
                self.process_new_round_event(event)?;
            }
        }

        self.vote_for_block(&pointer)?;
        self.run_pending_children(&hash)?;
        Ok(UpdateResult::Success)
    }

    /// The block-level validity conditions against a live parent.
    fn verify_pending_block(
        &self,
        block: &SignedBlock,
        parent: &BlockPointer,
    ) -> Result<(), &'static str> {
        if block.round() <= parent.round() {
            return Err("round not above parent");
        }
        if block.timestamp() <= parent.timestamp() {
            return Err("timestamp not above parent");
        }
        // Epoch linkage: same epoch, or parent's epoch plus one with a
        // verifying finalization entry.
        match block.epoch_finalization_entry() {
            None => {
                if block.epoch() != parent.epoch() {
                    return Err("epoch changed without finalization entry");
                }
            }
            Some(entry) => {
                if block.epoch() != parent.epoch() + 1 {
                    return Err("finalization entry without epoch increment");
                }
                if entry.epoch() != parent.epoch() {
                    return Err("finalization entry for wrong epoch");
                }
                let committee = self
                    .epochs
                    .committee_for(entry.epoch())
                    .ok_or("no committee for entry epoch")?;
                if entry
                    .verify(&self.genesis_hash, committee, self.epochs.threshold())
                    .is_err()
                {
                    return Err("finalization entry does not verify");
                }
                // The entry must finalize an ancestor the parent chain
                // actually contains.
                let finalized = self
                    .store
                    .tree()
                    .get_live_or_finalized(&entry.finalized_block())
                    .ok_or("entry names unknown block")?;
                if !self.store.tree().descends_from(&parent.hash(), &finalized) {
                    return Err("entry does not finalize an ancestor of the parent");
                }
            }
        }
        // The embedded certificate must be for the parent.
        let qc = block.quorum_cert();
        if qc.block() != parent.hash()
            || qc.round() != parent.round()
            || qc.epoch() != parent.epoch()
        {
            return Err("embedded certificate does not name the parent");
        }
        let qc_committee = self
            .epochs
            .committee_for(qc.epoch())
            .ok_or("no committee for certificate epoch")?;
        if qc
            .verify(&self.genesis_hash, qc_committee, self.epochs.threshold())
            .is_err()
        {
            return Err("embedded certificate does not verify");
        }
        // A round gap must be justified by a timeout certificate.
        match block.timeout_cert() {
            None => {
                if block.round() != qc.round() + 1 {
                    return Err("round gap without timeout certificate");
                }
            }
            Some(tc) => {
                if !tc.is_relevant_to(block.round()) {
                    return Err("timeout certificate for wrong round");
                }
                if qc.round() < tc.max_round() {
                    return Err("certificate behind the timeout witnesses");
                }
                if tc
                    .verify(&self.genesis_hash, self.epochs.threshold(), |epoch| {
                        self.epochs.committee_for(epoch)
                    })
                    .is_err()
                {
                    return Err("timeout certificate does not verify");
                }
            }
        }
        // Leadership: the proposer must hold a committee seat and its
        // lottery proof must win the round under the epoch's nonce; the
        // same proof is the block nonce. A block opening a new epoch is
        // judged before its epoch is seated, so fall back to the
        // committee in force at the parent.
        let committee = match self.epochs.committee_for(block.epoch()) {
            Some(committee) => committee,
            None if block.epoch_finalization_entry().is_some() => self
                .epochs
                .committee_for(parent.epoch())
                .ok_or("no committee for block epoch")?,
            None => return Err("no committee for block epoch"),
        };
        // For a block opening a new epoch the nonce is not seated yet, but
        // the entry pins it.
        let nonce = match self.epochs.leadership_nonce(block.epoch()) {
            Some(nonce) => nonce,
            None => block
                .epoch_finalization_entry()
                .and_then(|entry| self.epochs.nonce_for_entry(block.epoch(), entry))
                .ok_or("no leadership nonce for block epoch")?,
        };
        let seat = committee
            .finalizer_by_baker(block.baker_id())
            .ok_or("proposer is not in the committee")?;
        if *block.signature_key() != seat.sign_key {
            return Err("signature key does not match the committee record");
        }
        if block.verify_signature().is_err() {
            return Err("block signature does not verify");
        }
        if !leader_election::verify_leadership(seat, &nonce, block.round(), block.block_nonce()) {
            return Err("leadership proof does not win the round");
        }
        Ok(())
    }

    /// Runs all pending children of `parent`, recursively, in arrival
    /// order.
    fn run_pending_children(&mut self, parent: &BlockHash) -> anyhow::Result<()> {
        let mut queue: Vec<Arc<SignedBlock>> =
            self.store.tree_mut().take_pending_children(parent);
        while let Some(child) = queue.pop() {
            let parent_pointer = match self.store.tree().get_live_or_finalized(&child.parent()) {
                Some(pointer) => pointer,
                None => {
                    // The parent died between queueing and processing.
                    self.mark_block_dead(&child.hash(), "dead_parent");
                    continue;
                }
            };
            let child_hash = child.hash();
            self.verify_and_insert_block(child, parent_pointer)?;
            queue.extend(self.store.tree_mut().take_pending_children(&child_hash));
        }
        Ok(())
    }

    /// Promotes pending blocks whose round has become reachable; used
    /// after round advances to pull in blocks that arrived out of order.
    /// The batch is snapshotted first so a block that re-enters the
    /// pending table is not popped again in the same pass.
    fn drain_pending_until_current(&mut self) {
        let target = self.current_round();
        let mut batch = Vec::new();
        while let Some(block) = self.store.tree_mut().take_next_pending_until(target) {
            batch.push(block);
        }
        for block in batch {
            let _ = self.receive_block_known_time(block);
        }
    }

    // ---------------------------------------------------------------
    // Quorum messages
    // ---------------------------------------------------------------

    /// Receives and, when valid, aggregates a quorum message; forms a
    /// certificate and advances the round at threshold.
    pub fn process_quorum_message(&mut self, message: QuorumMessage) -> UpdateResult {
        if self.is_shut_down {
            return UpdateResult::ConsensusShutDown;
        }
        let committee = match self.epochs.committee_arc_for(self.current_epoch()) {
            Some(committee) => committee,
            None => return UpdateResult::Unverifiable,
        };
        let outcome = self.quorum_pool.receive(
            &message,
            &self.genesis_hash,
            self.current_round(),
            self.current_epoch(),
            &committee,
            self.store.tree(),
        );
        let verified = match outcome {
            ReceiveQuorumResult::Received(v) | ReceiveQuorumResult::ReceivedNoRelay(v) => v,
            ReceiveQuorumResult::Duplicate => return UpdateResult::Duplicate,
            ReceiveQuorumResult::CatchupRequired => return UpdateResult::CatchupRequired,
            ReceiveQuorumResult::Rejected(QuorumRejectReason::ObsoleteRound) => {
                return UpdateResult::Stale;
            }
            ReceiveQuorumResult::Rejected(QuorumRejectReason::DoubleSigning) => {
                if let Some(first) = self.quorum_pool.message_from(message.finalizer) {
                    self.misbehaviour.flag(Misbehaviour::QuorumDoubleSigning {
                        first: Box::new(first.clone()),
                        second: Box::new(message),
                    });
                }
                return UpdateResult::Invalid;
            }
            ReceiveQuorumResult::Rejected(_) => return UpdateResult::Invalid,
        };

        let weight = committee
            .finalizer(verified.0.finalizer)
            .map(|info| info.weight)
            .unwrap_or(0);
        let block = verified.0.block;
        let round = verified.0.round;
        let epoch = verified.0.epoch;
        let accumulator = self.quorum_pool.add_verified(verified, weight);
        let formed = self
            .epochs
            .threshold()
            .met_by(accumulator.weight(), committee.total_weight());
        if !formed {
            return UpdateResult::Success;
        }
        let qc = match self.quorum_pool.certificate_for(&block, round, epoch) {
            Some(qc) => qc,
            None => return UpdateResult::Success,
        };
        info!(round, block = %block.short_str(), "quorum certificate formed");
        match self.handle_new_quorum_cert(qc) {
            Ok(()) => UpdateResult::Success,
            Err(e) => {
                error!(error = %e, "fatal error applying quorum certificate");
                self.shutdown();
                UpdateResult::ConsensusShutDown
            }
        }
    }

    /// Applies a freshly formed or received certificate: finality check,
    /// highest-certificate slot, round advance, block production hook.
    fn handle_new_quorum_cert(&mut self, qc: QuorumCert) -> anyhow::Result<()> {
        self.note_certificate(&qc);
        finality::check_finality(&mut self.store, self.payload.as_ref(), &qc)?;
        self.maybe_trigger_epoch_transition()?;
        let _ = self.round_state.update_highest_certified(qc.clone())?;
        if self.current_round() <= qc.round() {
            let event = self
                .round_state
                .advance_round(qc.round() + 1, AdvanceCause::Quorum(qc))?;
            self.process_new_round_event(event)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Timeout messages
    // ---------------------------------------------------------------

    /// Receives a timeout message and, when valid, executes it
    /// immediately (no intervening state mutation).
    pub fn process_timeout_message(&mut self, message: TimeoutMessage) -> UpdateResult {
        if self.is_shut_down {
            return UpdateResult::ConsensusShutDown;
        }
        let last_finalized = self.store.tree().last_finalized().clone();
        let committee_for =
            |epoch: Epoch| -> Option<Arc<FinalizationCommittee>> { self.epochs.committee_arc_for(epoch) };
        let ctx = TimeoutReceiveContext {
            genesis: &self.genesis_hash,
            current_round: self.round_state.current_round(),
            current_epoch: self.round_state.current_epoch(),
            last_finalized_round: last_finalized.round(),
            last_finalized_epoch: last_finalized.epoch(),
            last_finalized_hash: last_finalized.hash(),
            committee_for: &committee_for,
        };
        let outcome = receive_timeout_message(
            &message,
            self.timeout_window.as_ref(),
            self.store.tree(),
            &ctx,
        );
        match outcome {
            ReceiveTimeoutResult::Duplicate => UpdateResult::Duplicate,
            ReceiveTimeoutResult::CatchupRequired => UpdateResult::CatchupRequired,
            ReceiveTimeoutResult::Rejected(reason) => {
                match reason {
                    TimeoutRejectReason::ObsoleteRound | TimeoutRejectReason::ObsoleteQC => {
                        UpdateResult::Stale
                    }
                    TimeoutRejectReason::DoubleSigning => {
                        if let Some(first) = self
                            .timeout_window
                            .as_ref()
                            .and_then(|w| w.message_from(message.finalizer()))
                        {
                            self.misbehaviour.flag(Misbehaviour::TimeoutDoubleSigning {
                                first: Box::new(first.clone()),
                                second: Box::new(message),
                            });
                        }
                        UpdateResult::Invalid
                    }
                    _ => UpdateResult::Invalid,
                }
            }
            ReceiveTimeoutResult::Received(partially_verified) => {
                match self.execute_timeout_message(*partially_verified) {
                    Ok(result) => result,
                    Err(e) => {
                        error!(error = %e, "fatal error executing timeout message");
                        self.shutdown();
                        UpdateResult::ConsensusShutDown
                    }
                }
            }
        }
    }

    /// Second half of timeout reception: the embedded certificate is
    /// validated against the committee resolved during receive, then the
    /// message joins the two-epoch window.
    pub(crate) fn execute_timeout_message(
        &mut self,
        pvtm: PartiallyVerifiedTimeoutMessage,
    ) -> anyhow::Result<UpdateResult> {
        let qc = pvtm.message.quorum_cert().clone();
        if qc.round() > self.round_state.highest_certified().round() {
            if qc
                .verify(&self.genesis_hash, &pvtm.qc_committee, self.epochs.threshold())
                .is_err()
            {
                self.misbehaviour.flag(Misbehaviour::TimeoutMessageInvalidQC {
                    message: Box::new(pvtm.message.clone()),
                });
                return Ok(UpdateResult::Invalid);
            }
            self.note_certificate(&qc);
            finality::check_finality(&mut self.store, self.payload.as_ref(), &qc)?;
            self.maybe_trigger_epoch_transition()?;
            let _ = self.round_state.update_highest_certified(qc.clone())?;
            if self.current_round() <= qc.round() {
                let event = self
                    .round_state
                    .advance_round(qc.round() + 1, AdvanceCause::Quorum(qc.clone()))?;
                self.process_new_round_event(event)?;
            }
        } else if let Some(witnessed_epoch) = self.qc_witnesses.get(&qc.round()) {
            if *witnessed_epoch != qc.epoch() {
                debug!(round = qc.round(), "timeout message certificate epoch mismatch");
                return Ok(UpdateResult::Invalid);
            }
        }
        self.process_timeout(pvtm)?;
        Ok(UpdateResult::Success)
    }

    /// Inserts into the two-epoch window and forms a timeout certificate
    /// at threshold.
    pub(crate) fn process_timeout(
        &mut self,
        pvtm: PartiallyVerifiedTimeoutMessage,
    ) -> anyhow::Result<()> {
        let message = pvtm.message.clone();
        let message_round = message.round();
        let outcome = match self.timeout_window.as_mut() {
            None => {
                self.timeout_window = Some(TimeoutMessagesWindow::new(message));
                InsertOutcome::Inserted
            }
            Some(window) => window.insert(message),
        };
        if outcome == InsertOutcome::TooOld {
            return Ok(());
        }
        if message_round != self.current_round() {
            return Ok(());
        }
        let window = match self.timeout_window.as_ref() {
            Some(window) => window,
            None => return Ok(()),
        };
        let signed_weight = window.signed_weight_for(message_round, &pvtm.qc_committee);
        if !self
            .epochs
            .threshold()
            .met_by(signed_weight, pvtm.qc_committee.total_weight())
        {
            return Ok(());
        }
        let cert = window.certificate_for(message_round);
        info!(round = message_round, "timeout certificate formed");
        let highest = self.round_state.highest_certified().clone();
        let event = self.round_state.advance_round(
            self.current_round() + 1,
            AdvanceCause::Timeout {
                cert,
                highest_qc: highest,
            },
        )?;
        self.process_new_round_event(event)?;
        Ok(())
    }

    /// The local round timer fired.
    pub fn upon_timeout_event(&mut self, event: RoundTimeoutEvent) {
        if self.is_shut_down || event.round != self.current_round() {
            return;
        }
        if let Err(e) = self.local_timeout_round() {
            error!(error = %e, "fatal error handling round timeout");
            self.shutdown();
        }
    }

    fn local_timeout_round(&mut self) -> anyhow::Result<()> {
        let epoch = self.current_epoch();
        let round = self.current_round();
        let committee = match self.epochs.committee_arc_for(epoch) {
            Some(committee) => committee,
            None => return Ok(()),
        };
        let generator = match &self.proposal_generator {
            Some(generator) => generator,
            None => return Ok(()),
        };
        let seat = match committee.finalizer_by_baker(generator.signer().baker_id()) {
            Some(seat) => seat.clone(),
            None => return Ok(()),
        };
        warn!(round, "round timed out");

        let grown = self.round_state.grow_timeout(self.genesis.parameters.timeout_increase)?;

        // Reuse the persisted message when this round was already signed,
        // so a timer re-fire never double-signs.
        let message = match self.round_state.status().last_signed_timeout_message.clone() {
            Some(message) if message.round() == round => message,
            _ => {
                let signer = generator.signer().clone();
                let highest = self.round_state.highest_certified().clone();
                let message = TimeoutMessage::create(
                    &self.genesis_hash,
                    seat.index,
                    round,
                    epoch,
                    highest,
                    |bytes| signer.sign_with_aggregation_key(bytes),
                    signer.block_key(),
                );
                self.round_state
                    .set_last_signed_timeout_message(message.clone())?;
                message
            }
        };
        self.network
            .broadcast(ConsensusMsg::TimeoutMessage(Box::new(message.clone())));
        // Re-arm so an unbroken timeout keeps escalating.
        self.time.schedule_round_timeout(round, grown);

        // Single-node loopback.
        let qc_committee = match self.epochs.committee_arc_for(message.quorum_cert().epoch()) {
            Some(committee) => committee,
            None => return Ok(()),
        };
        self.process_timeout(PartiallyVerifiedTimeoutMessage {
            message,
            qc_committee,
        })?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Round and epoch transitions
    // ---------------------------------------------------------------

    /// Timer reset plus the leader's block production, run after every
    /// persisted round advance.
    pub(crate) fn process_new_round_event(&mut self, event: NewRoundEvent) -> anyhow::Result<()> {
        debug!("processing {event}");
        self.quorum_pool.reset(event.round);
        self.arm_round_timer();
        if self.defer_block_production {
            return Ok(());
        }
        self.try_produce_block()
    }

    /// Produces, broadcasts and loops back a proposal iff the local
    /// identity wins the current round's lottery.
    pub(crate) fn try_produce_block(&mut self) -> anyhow::Result<()> {
        let round = self.current_round();
        let epoch = self.current_epoch();
        let generator = match &self.proposal_generator {
            Some(generator) => generator,
            None => return Ok(()),
        };
        let committee = match self.epochs.committee_for(epoch) {
            Some(committee) => committee,
            None => return Ok(()),
        };
        let nonce = match self.epochs.leadership_nonce(epoch) {
            Some(nonce) => nonce,
            None => return Ok(()),
        };
        let seat = match committee.finalizer_by_baker(generator.signer().baker_id()) {
            Some(seat) => seat,
            None => return Ok(()),
        };
        let proof = generator
            .signer()
            .prove_vrf(&leader_election::election_message(&nonce, round));
        if !leader_election::verify_leadership(seat, &nonce, round, &proof) {
            return Ok(());
        }

        let highest = self.round_state.highest_certified().clone();
        let parent = match self.store.tree().get_live_or_finalized(&highest.block()) {
            Some(parent) => parent,
            None => {
                // A certificate for a block we do not hold is a broken
                // invariant, not a protocol message to tolerate.
                bail!("highest certified block {} is not in the tree", highest.block());
            }
        };
        let timeout_cert = self
            .round_state
            .previous_round_timeout()
            .filter(|timeout| timeout.cert.is_relevant_to(round))
            .map(|timeout| timeout.cert.clone());
        let entry = if parent.epoch() < epoch {
            match self.store.storage().latest_finalization_entry()? {
                Some(entry) => Some(entry),
                None => bail!("epoch advanced without a finalization entry on record"),
            }
        } else {
            None
        };
        let block = generator
            .generate_proposal(
                round,
                epoch,
                proof,
                &parent,
                highest,
                timeout_cert,
                entry,
                self.payload.as_ref(),
                self.execution.as_ref(),
                self.time.now(),
            )
            .context("generating proposal")?;
        counters::PROPOSED_BLOCKS_COUNT.inc();
        let block = Arc::new(block);
        self.network.broadcast(ConsensusMsg::Block(block.clone()));
        let result = self.receive_block_known_time(block);
        debug!(result = ?result, "loopback of own proposal");
        Ok(())
    }

    /// Signs and sends a quorum message for a block that just became
    /// live in the current round, at most once per round.
    fn vote_for_block(&mut self, pointer: &Arc<BlockPointer>) -> anyhow::Result<()> {
        if pointer.round() != self.current_round() || pointer.epoch() != self.current_epoch() {
            return Ok(());
        }
        let generator = match &self.proposal_generator {
            Some(generator) => generator,
            None => return Ok(()),
        };
        let committee = match self.epochs.committee_arc_for(pointer.epoch()) {
            Some(committee) => committee,
            None => return Ok(()),
        };
        let seat = match committee.finalizer_by_baker(generator.signer().baker_id()) {
            Some(seat) => seat.clone(),
            None => return Ok(()),
        };
        if let Some(last) = &self.round_state.status().last_signed_quorum_message {
            if last.round >= pointer.round() {
                return Ok(());
            }
        }
        let signer = generator.signer().clone();
        let message = QuorumMessage::create(
            &self.genesis_hash,
            seat.index,
            pointer.hash(),
            pointer.round(),
            pointer.epoch(),
            |bytes| signer.sign_with_aggregation_key(bytes),
        );
        self.round_state
            .set_last_signed_quorum_message(message.clone())?;
        self.network
            .broadcast(ConsensusMsg::QuorumMessage(Box::new(message.clone())));
        debug!(block = %pointer.hash().short_str(), round = pointer.round(), "voted");
        // Loopback into the local pool.
        let _ = self.process_quorum_message(message);
        Ok(())
    }

    /// Applies an epoch transition driven by `entry`, which finalized the
    /// trigger block of the boundary.
    fn apply_epoch_transition(
        &mut self,
        new_epoch: Epoch,
        entry: kestrel_consensus_types::finalization_entry::FinalizationEntry,
    ) -> anyhow::Result<()> {
        let nonce = self.epochs.advance_epoch(new_epoch, &entry);
        self.store.storage().write_epoch_nonce(new_epoch, &nonce)?;
        self.round_state.advance_epoch(new_epoch)?;
        // Quorum votes cast under the previous epoch cannot count in the
        // new one.
        self.quorum_pool.reset(self.current_round());
        Ok(())
    }

    /// After a finalization, checks whether the finalized block crossed
    /// the epoch boundary and transitions if so.
    pub(crate) fn maybe_trigger_epoch_transition(&mut self) -> anyhow::Result<()> {
        let last = self.store.tree().last_finalized().clone();
        let boundary = self
            .genesis
            .parameters
            .timestamp
            .saturating_add((self.current_epoch() + 1).saturating_mul(self.genesis.parameters.epoch_duration_ms));
        if last.timestamp() < boundary {
            return Ok(());
        }
        let entry = match self.store.storage().latest_finalization_entry()? {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let new_epoch = self.current_epoch() + 1;
        info!(epoch = new_epoch, trigger = %last.hash().short_str(), "epoch boundary crossed");
        self.apply_epoch_transition(new_epoch, entry)
    }

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    fn arm_round_timer(&self) {
        if self.is_local_finalizer_in(self.current_epoch()) {
            self.time
                .schedule_round_timeout(self.current_round(), self.round_state.current_timeout());
        }
    }

    pub(crate) fn is_local_finalizer_in(&self, epoch: Epoch) -> bool {
        let generator = match &self.proposal_generator {
            Some(generator) => generator,
            None => return false,
        };
        self.epochs
            .committee_for(epoch)
            .and_then(|committee| committee.finalizer_by_baker(generator.signer().baker_id()))
            .is_some()
    }

    /// Records the round→epoch witness of a verified certificate.
    pub(crate) fn note_certificate(&mut self, qc: &QuorumCert) {
        if !qc.is_genesis() {
            self.qc_witnesses.insert(qc.round(), qc.epoch());
            let finalized_round = self.store.tree().last_finalized().round();
            self.qc_witnesses = self.qc_witnesses.split_off(&finalized_round);
        }
    }

    fn mark_block_dead(&mut self, hash: &BlockHash, cause: &'static str) {
        self.store.tree_mut().mark_dead(hash);
        counters::DEAD_BLOCKS_COUNT.with_label_values(&[cause]).inc();
    }

    fn fatal(&mut self, error: crate::persistent_storage::StorageError) -> UpdateResult {
        error!(error = %error, "fatal storage error");
        self.shutdown();
        UpdateResult::ConsensusShutDown
    }
}
