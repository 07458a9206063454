// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Finality detection over the chained quorum certificates.
//!
//! A certificate for block `B` finalizes `B`'s parent when `B` sits in
//! the round directly after its parent within the same epoch: two
//! consecutive certified rounds witness that no competing branch can
//! gather a quorum below them.

use crate::{
    block_storage::{BlockPointer, BlockStore},
    persistent_storage::StorageResult,
    state_replication::PayloadProvider,
};
use kestrel_consensus_types::{
    finalization_entry::FinalizationEntry, quorum_cert::QuorumCert,
};
use std::sync::Arc;
use tracing::debug;

/// Checks whether `qc` newly finalizes a block; if so, persists and
/// applies the finalization (chain walk, pruning, pending drain, refocus)
/// and returns the new last finalized pointer.
///
/// The certificate must already be verified. A certificate for a block
/// that is not alive locally finalizes nothing yet and is skipped.
pub fn check_finality(
    store: &mut BlockStore,
    payload: &dyn PayloadProvider,
    qc: &QuorumCert,
) -> StorageResult<Option<Arc<BlockPointer>>> {
    let block = match store.tree().get_alive(&qc.block()) {
        Some(block) => block,
        None => return Ok(None),
    };
    let parent = match store.tree().get_live_or_finalized(&block.parent()) {
        Some(parent) => parent,
        None => return Ok(None),
    };
    let last_finalized = store.tree().last_finalized().clone();
    if block.round() != parent.round() + 1
        || block.epoch() != parent.epoch()
        || parent.round() <= last_finalized.round()
    {
        return Ok(None);
    }

    // The entry pairs the parent's certificate (embedded in the block)
    // with the certificate that arrived for the block itself. Alive
    // blocks always carry their signed form.
    let parent_qc = match block.block() {
        Some(signed) => signed.quorum_cert().clone(),
        None => return Ok(None),
    };
    let entry = FinalizationEntry::new(parent_qc, qc.clone());

    // Walk from the newly finalized block down to (but excluding) the
    // previous last finalized block, then finalize in height order.
    let mut chain = Vec::new();
    let mut cursor = parent.clone();
    while cursor.hash() != last_finalized.hash() {
        chain.push(cursor.clone());
        cursor = match store.tree().get_live_or_finalized(&cursor.parent()) {
            Some(pointer) => pointer,
            None => {
                debug!(
                    block = %cursor.parent().short_str(),
                    "finalizing chain hit an unlinked ancestor"
                );
                return Ok(None);
            }
        };
    }
    chain.reverse();

    let old_focus = store.tree().focus_block().hash();
    store.finalize(&chain, &entry)?;
    let new_focus = store.tree().focus_block().hash();
    if new_focus != old_focus {
        payload.focus_changed(&new_focus);
    }
    Ok(Some(parent))
}
