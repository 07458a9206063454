// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    block_storage::{BlockPointer, BlockStatus, BlockTree, RecentBlockStatus},
    counters,
    persistent_storage::{PersistentStorage, StorageResult, StoredBlock},
};
use kestrel_consensus_types::{
    common::{BlockHash, Height},
    finalization_entry::FinalizationEntry,
};
use std::sync::Arc;
use tracing::info;

/// The tree plus its disk-backed finalized tail. All mutation goes through
/// the consensus context owning this value; the storage handle may also be
/// shared read-only with the catch-up stream producer.
pub struct BlockStore {
    tree: BlockTree,
    storage: Arc<PersistentStorage>,
}

impl BlockStore {
    pub fn new(tree: BlockTree, storage: Arc<PersistentStorage>) -> Self {
        Self { tree, storage }
    }

    pub fn tree(&self) -> &BlockTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut BlockTree {
        &mut self.tree
    }

    pub fn storage(&self) -> &Arc<PersistentStorage> {
        &self.storage
    }

    /// Status without reading block bytes: tree memory first, then the
    /// hash-to-height index for blocks finalized past the retained tail.
    pub fn get_recent_block_status(&self, hash: &BlockHash) -> StorageResult<RecentBlockStatus> {
        match self.tree.block_status(hash) {
            BlockStatus::Unknown => {
                if self.storage.finalized_height_of(hash)?.is_some() {
                    Ok(RecentBlockStatus::OldFinalized)
                } else {
                    Ok(RecentBlockStatus::Recent(BlockStatus::Unknown))
                }
            }
            status => Ok(RecentBlockStatus::Recent(status)),
        }
    }

    /// Full status; for blocks evicted from memory this reads the block
    /// from the store, so it may block on disk.
    pub fn get_block_status(&self, hash: &BlockHash) -> StorageResult<RecentBlockStatus> {
        match self.tree.block_status(hash) {
            BlockStatus::Unknown => match self.storage.finalized_height_of(hash)? {
                Some(height) => {
                    // The index names the height; the block must be there.
                    match self.storage.finalized_block_at_height(height)? {
                        Some(_) => Ok(RecentBlockStatus::OldFinalized),
                        None => Err(crate::persistent_storage::StorageError::Corrupted {
                            context: "finalized block",
                            message: format!("height {height} indexed but absent"),
                        }),
                    }
                }
                None => Ok(RecentBlockStatus::Recent(BlockStatus::Unknown)),
            },
            status => Ok(RecentBlockStatus::Recent(status)),
        }
    }

    /// Whether `hash` is finalized, either in memory or on disk.
    pub fn is_finalized(&self, hash: &BlockHash) -> StorageResult<bool> {
        match self.tree.block_status(hash) {
            BlockStatus::Finalized(_) => Ok(true),
            BlockStatus::Unknown => Ok(self.storage.finalized_height_of(hash)?.is_some()),
            _ => Ok(false),
        }
    }

    pub fn finalized_block_at_height(&self, height: Height) -> StorageResult<Option<StoredBlock>> {
        self.storage.finalized_block_at_height(height)
    }

    /// Persists the newly finalized `chain` (ascending heights) together
    /// with `entry`, then applies finalization to the tree: pruning
    /// competitors, draining overtaken pending blocks and refocusing.
    pub fn finalize(
        &mut self,
        chain: &[Arc<BlockPointer>],
        entry: &FinalizationEntry,
    ) -> StorageResult<Vec<BlockHash>> {
        let stored: Vec<StoredBlock> = chain.iter().map(|p| StoredBlock::from_pointer(p)).collect();
        self.storage.write_finalized(&stored, entry)?;
        let pruned = self.tree.finalize_chain(chain);
        let last = self.tree.last_finalized();
        counters::LAST_FINALIZED_ROUND.set(last.round() as i64);
        counters::LAST_FINALIZED_HEIGHT.set(last.height() as i64);
        counters::FINALIZED_BLOCKS_COUNT.inc_by(chain.len() as u64);
        counters::DEAD_BLOCKS_COUNT
            .with_label_values(&["pruned"])
            .inc_by(pruned.len() as u64);
        info!(
            block = %last.hash().short_str(),
            round = last.round(),
            height = last.height(),
            pruned = pruned.len(),
            "advanced finalization"
        );
        Ok(pruned)
    }
}
