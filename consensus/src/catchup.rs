// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! The catch-up protocol: compact status digests, the decision of who is
//! behind, a pull-driven response stream of missing blocks, and the
//! application of a response's terminal data.
//!
//! The response producer yields one block per pull and the terminal data
//! once no blocks remain, so the transport can cap blocks per response
//! without the core knowing the cap.

use crate::{
    block_storage::BlockStatus,
    counters,
    liveness::round_state::AdvanceCause,
    persistent_storage::{PersistentStorage, StorageResult, StoredBlock},
    round_manager::RoundManager,
    timeout_messages::TimeoutMessagesWindow,
    UpdateResult,
};
use kestrel_consensus_types::{
    block::SignedBlock,
    catch_up::{CatchUpStatus, CatchUpTerminalData, CatchUpTimeoutSummary},
    common::{BlockHash, Height},
    finalizer_set::FinalizerSet,
    quorum_cert::QuorumCert,
    timeout_message::TimeoutMessage,
};
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "catchup_test.rs"]
mod catchup_test;

/// Builds this node's status digest. A lightweight status (`light`)
/// omits the leaves and branches; it is what gets broadcast so peers can
/// notice they are behind, while a request carries the full tree shape.
pub fn make_status(manager: &RoundManager, light: bool) -> CatchUpStatus {
    let tree = manager.block_store().tree();
    let (leaves, branches) = if light {
        (Vec::new(), Vec::new())
    } else {
        (
            tree.leaves().iter().map(|p| p.hash()).collect(),
            tree.internal_branches().iter().map(|p| p.hash()).collect(),
        )
    };
    let timeout_summary = manager.timeout_window.as_ref().map(window_summary);
    CatchUpStatus {
        last_finalized_block: tree.last_finalized().hash(),
        last_finalized_round: tree.last_finalized().round(),
        leaves,
        branches,
        current_round: manager.current_round(),
        current_epoch: manager.current_epoch(),
        quorum_signers: manager.quorum_pool.signer_sets(),
        timeout_summary,
    }
}

fn window_summary(window: &TimeoutMessagesWindow) -> CatchUpTimeoutSummary {
    let (first_epoch, first, second) = window.signer_summary();
    CatchUpTimeoutSummary {
        first_epoch,
        first_epoch_finalizers: first,
        second_epoch_finalizers: second,
    }
}

/// Whether `their` status shows the peer holds consensus state we lack.
pub fn is_catch_up_required(their: &CatchUpStatus, manager: &RoundManager) -> bool {
    let my_round = manager.current_round();
    let my_finalized_round = manager.block_store().tree().last_finalized().round();
    if their.current_round > my_round || their.last_finalized_round > my_finalized_round {
        return true;
    }
    if their.current_round <= my_finalized_round {
        return false;
    }
    // A leaf of theirs we do not hold live.
    for leaf in &their.leaves {
        match manager.block_store().tree().block_status(leaf) {
            BlockStatus::Unknown | BlockStatus::Pending(_) => return true,
            _ => {}
        }
    }
    if their.current_round == my_round {
        // A quorum signature of theirs we do not hold.
        for (block, signers) in &their.quorum_signers {
            let mine = manager
                .quorum_pool
                .signer_sets()
                .into_iter()
                .find(|(b, _)| b == block)
                .map(|(_, set)| set)
                .unwrap_or_else(FinalizerSet::empty);
            if !signers.is_subset_of(&mine) {
                return true;
            }
        }
        // A timeout signature of theirs, from a relevant epoch, that we
        // do not hold.
        if let Some(theirs) = &their.timeout_summary {
            let relevant = |epoch: u64| {
                epoch + 1 >= manager.current_epoch() && epoch <= manager.current_epoch()
            };
            let mine = manager.timeout_window.as_ref().map(window_summary);
            for (epoch, their_set) in [
                (theirs.first_epoch, &theirs.first_epoch_finalizers),
                (theirs.first_epoch + 1, &theirs.second_epoch_finalizers),
            ] {
                if their_set.is_empty() || !relevant(epoch) {
                    continue;
                }
                let my_set = mine
                    .as_ref()
                    .and_then(|m| {
                        if m.first_epoch == epoch {
                            Some(m.first_epoch_finalizers.clone())
                        } else if m.first_epoch + 1 == epoch {
                            Some(m.second_epoch_finalizers.clone())
                        } else {
                            None
                        }
                    })
                    .unwrap_or_else(FinalizerSet::empty);
                if !their_set.is_subset_of(&my_set) {
                    return true;
                }
            }
        }
    }
    false
}

/// One step of a catch-up response stream.
#[derive(Debug)]
pub enum CatchUpItem {
    Block(Arc<SignedBlock>),
    /// End of stream; carries the terminal data exactly once.
    Done(CatchUpTerminalData),
}

/// The lazily driven response producer. Holds a read-only snapshot of the
/// alive tree and streams finalized blocks straight from the store
/// without participating in the writer's mutations.
pub struct CatchUpResponseProducer {
    storage: Arc<PersistentStorage>,
    next_height: Height,
    last_finalized_height: Height,
    alive: VecDeque<Arc<SignedBlock>>,
    their_known: HashSet<BlockHash>,
    forced: HashSet<BlockHash>,
    terminal: Option<CatchUpTerminalData>,
}

impl CatchUpResponseProducer {
    /// The next block, or the terminal data when no blocks remain.
    /// Subsequent calls after `Done` yield an empty terminal record.
    pub fn next_item(&mut self) -> StorageResult<CatchUpItem> {
        while self.next_height <= self.last_finalized_height {
            let height = self.next_height;
            self.next_height += 1;
            if let Some(StoredBlock::Block { block, .. }) =
                self.storage.finalized_block_at_height(height)?
            {
                let hash = block.hash();
                if !self.their_known.contains(&hash) {
                    self.forced.insert(hash);
                    counters::CATCHUP_BLOCKS_SENT.inc();
                    return Ok(CatchUpItem::Block(Arc::new(block)));
                }
            }
        }
        while let Some(block) = self.alive.pop_front() {
            let hash = block.hash();
            if !self.their_known.contains(&hash) || self.forced.contains(&block.parent()) {
                self.forced.insert(hash);
                counters::CATCHUP_BLOCKS_SENT.inc();
                return Ok(CatchUpItem::Block(block));
            }
        }
        Ok(CatchUpItem::Done(self.terminal.take().unwrap_or_default()))
    }
}

/// Serves a peer's catch-up request from the current state: which blocks
/// to stream and the terminal data that closes the stream.
pub fn handle_catch_up_request(
    manager: &RoundManager,
    their: &CatchUpStatus,
) -> StorageResult<CatchUpResponseProducer> {
    let tree = manager.block_store().tree();
    let storage = manager.block_store().storage().clone();

    let empty = CatchUpResponseProducer {
        storage: storage.clone(),
        next_height: 1,
        last_finalized_height: 0,
        alive: VecDeque::new(),
        their_known: HashSet::new(),
        forced: HashSet::new(),
        terminal: None,
    };

    // A peer whose finalized tip we consider neither finalized nor alive
    // is on a different view we cannot serve.
    let their_finalized_height = match storage.finalized_height_of(&their.last_finalized_block)? {
        Some(height) => Some(height),
        None => match tree.block_status(&their.last_finalized_block) {
            BlockStatus::Alive(_) | BlockStatus::Finalized(_) => None,
            _ => {
                debug!(
                    block = %their.last_finalized_block.short_str(),
                    "peer's finalized tip is foreign; returning empty catch-up response"
                );
                return Ok(empty);
            }
        },
    };

    let my_finalized_height = tree.last_finalized().height();
    let (next_height, last_finalized_height) = match their_finalized_height {
        Some(theirs) if theirs < my_finalized_height => (theirs + 1, my_finalized_height),
        _ => (1, 0),
    };

    let mut their_known: HashSet<BlockHash> = their.leaves.iter().copied().collect();
    their_known.extend(their.branches.iter().copied());
    their_known.insert(their.last_finalized_block);

    // Alive blocks, height by height.
    let mut alive = VecDeque::new();
    let mut height = tree.last_finalized().height() + 1;
    while height <= tree.highest_alive_height() {
        for pointer in tree.alive_at_height(height) {
            if let Some(block) = pointer.block() {
                alive.push_back(block.clone());
            }
        }
        height += 1;
    }

    Ok(CatchUpResponseProducer {
        storage,
        next_height,
        last_finalized_height,
        alive,
        their_known,
        forced: HashSet::new(),
        terminal: Some(make_terminal_data(manager, their)?),
    })
}

fn make_terminal_data(
    manager: &RoundManager,
    their: &CatchUpStatus,
) -> StorageResult<CatchUpTerminalData> {
    let highest = manager.round_state.highest_certified().clone();
    let mut quorum_certs: Vec<QuorumCert> = Vec::new();
    if let Some(entry) = manager.block_store().storage().latest_finalization_entry()? {
        let finalization_qc = entry.successor_qc().clone();
        if finalization_qc != highest {
            quorum_certs.push(finalization_qc);
        }
    }
    if !highest.is_genesis() {
        quorum_certs.push(highest);
    }

    let timeout_cert = if their.current_round < manager.current_round() {
        manager
            .round_state
            .previous_round_timeout()
            .map(|timeout| timeout.cert.clone())
    } else {
        None
    };

    let same_round = their.current_round == manager.current_round();
    let quorum_messages = manager
        .quorum_pool
        .messages()
        .filter(|message| {
            if !same_round {
                return true;
            }
            their
                .quorum_signers_for(&message.block)
                .map(|signers| !signers.contains(message.finalizer))
                .unwrap_or(true)
        })
        .cloned()
        .collect();

    let timeout_messages = match &manager.timeout_window {
        None => Vec::new(),
        Some(window) => filter_timeout_messages(window, their, manager.current_round()),
    };

    Ok(CatchUpTerminalData {
        quorum_certs,
        timeout_cert,
        quorum_messages,
        timeout_messages,
    })
}

/// Selects the stored timeout messages the peer is missing, under the
/// four alignments of the two epoch windows.
fn filter_timeout_messages(
    window: &TimeoutMessagesWindow,
    their: &CatchUpStatus,
    current_round: u64,
) -> Vec<TimeoutMessage> {
    let mine_first: Vec<&TimeoutMessage> = window
        .first_epoch_timeouts()
        .filter(|m| m.round() == current_round)
        .collect();
    let mine_second: Vec<&TimeoutMessage> = window
        .second_epoch_timeouts()
        .filter(|m| m.round() == current_round)
        .collect();
    let keep =
        |messages: &[&TimeoutMessage], known: Option<&FinalizerSet>| -> Vec<TimeoutMessage> {
            messages
                .iter()
                .filter(|m| known.map(|set| !set.contains(m.finalizer())).unwrap_or(true))
                .map(|m| (*m).clone())
                .collect()
        };

    let theirs = match &their.timeout_summary {
        // They have no timeout state at all; send everything.
        None => {
            let mut all = keep(&mine_first, None);
            all.extend(keep(&mine_second, None));
            return all;
        }
        Some(summary) => summary,
    };
    let mine_epoch = window.first_epoch();
    let their_epoch = theirs.first_epoch;

    let mut selected = Vec::new();
    if mine_epoch == their_epoch {
        selected.extend(keep(&mine_first, Some(&theirs.first_epoch_finalizers)));
        selected.extend(keep(&mine_second, Some(&theirs.second_epoch_finalizers)));
    } else if mine_epoch == their_epoch + 1 {
        // My window starts where theirs ends.
        selected.extend(keep(&mine_first, Some(&theirs.second_epoch_finalizers)));
        selected.extend(keep(&mine_second, None));
    } else if mine_epoch + 1 == their_epoch {
        // Their window starts where mine ends; my first bucket predates
        // anything they would accept.
        selected.extend(keep(&mine_second, Some(&theirs.first_epoch_finalizers)));
    } else if mine_epoch > their_epoch {
        // They trail by more than a window: everything is news to them.
        selected.extend(keep(&mine_first, None));
        selected.extend(keep(&mine_second, None));
    }
    // mine_epoch + 1 < their_epoch: they are far ahead, nothing to send.
    selected
}

/// Drives a producer into a bounded channel. Sending suspends when the
/// transport is slow; everything read by the producer is a snapshot or a
/// store read, so the consensus context keeps running meanwhile.
pub async fn stream_catch_up_response(
    mut producer: CatchUpResponseProducer,
    sender: mpsc::Sender<CatchUpItem>,
) {
    loop {
        let item = match producer.next_item() {
            Ok(item) => item,
            Err(error) => {
                warn!(error = %error, "catch-up stream aborted on storage error");
                return;
            }
        };
        let done = matches!(item, CatchUpItem::Done(_));
        if sender.send(item).await.is_err() || done {
            return;
        }
    }
}

/// Outcome of applying terminal data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalDataResult {
    /// All data applied; `progress` reports whether anything advanced.
    Success { progress: bool },
    /// An invalid datum stopped processing; earlier progress is kept.
    Invalid { progress: bool },
}

/// Applies a response's terminal data: certificates first, then the
/// unaggregated votes, with block production deferred until the whole
/// batch is in.
pub fn process_catch_up_terminal_data(
    manager: &mut RoundManager,
    data: &CatchUpTerminalData,
) -> TerminalDataResult {
    let round_before = manager.current_round();
    let finalized_before = manager.block_store().tree().last_finalized().round();
    manager.defer_block_production = true;
    let result = apply_terminal_data(manager, data);
    manager.defer_block_production = false;

    let progress = manager.current_round() > round_before
        || manager.block_store().tree().last_finalized().round() > finalized_before;
    match result {
        Ok(()) => {
            // The single deferred block-production opportunity.
            if let Err(error) = manager.try_produce_block() {
                warn!(error = %error, "block production after catch-up failed");
            }
            TerminalDataResult::Success { progress }
        }
        Err(()) => TerminalDataResult::Invalid { progress },
    }
}

fn apply_terminal_data(manager: &mut RoundManager, data: &CatchUpTerminalData) -> Result<(), ()> {
    for qc in data.quorum_certs.iter().take(2) {
        if qc.is_genesis() || qc.round() <= manager.block_store().tree().last_finalized().round() {
            continue;
        }
        let committee = match manager.epochs.committee_arc_for(qc.epoch()) {
            Some(committee) => committee,
            None => return Err(()),
        };
        if qc
            .verify(&manager.genesis_hash, &committee, manager.epochs.threshold())
            .is_err()
        {
            return Err(());
        }
        if manager.apply_external_quorum_cert(qc.clone()).is_err() {
            return Err(());
        }
    }

    if let Some(tc) = &data.timeout_cert {
        if manager.current_round() <= tc.round() {
            let verified = tc
                .verify(&manager.genesis_hash, manager.epochs.threshold(), |epoch| {
                    manager.epochs.committee_for(epoch)
                })
                .is_ok();
            if !verified {
                return Err(());
            }
            if manager.apply_external_timeout_cert(tc.clone()).is_err() {
                return Err(());
            }
        }
    }

    for message in &data.quorum_messages {
        if manager.process_quorum_message(message.clone()) == UpdateResult::Invalid {
            return Err(());
        }
    }
    for message in &data.timeout_messages {
        if manager.process_timeout_message(message.clone()) == UpdateResult::Invalid {
            return Err(());
        }
    }
    Ok(())
}

impl RoundManager {
    /// Applies a certificate received outside the vote path (catch-up),
    /// already verified by the caller.
    pub(crate) fn apply_external_quorum_cert(
        &mut self,
        qc: QuorumCert,
    ) -> anyhow::Result<()> {
        self.note_certificate(&qc);
        crate::finality::check_finality(&mut self.store, self.payload.as_ref(), &qc)?;
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

    /// Applies a timeout certificate received via catch-up, already
    /// verified by the caller.
    pub(crate) fn apply_external_timeout_cert(
        &mut self,
        cert: kestrel_consensus_types::timeout_cert::TimeoutCert,
    ) -> anyhow::Result<()> {
        if self.current_round() > cert.round() {
            return Ok(());
        }
        let highest = self.round_state.highest_certified().clone();
        let event = self.round_state.advance_round(
            cert.round() + 1,
            AdvanceCause::Timeout {
                cert,
                highest_qc: highest,
            },
        )?;
        self.process_new_round_event(event)?;
        Ok(())
    }
}
