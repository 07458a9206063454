// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    block_storage::{BlockPointer, BlockStatus},
    counters,
};
use kestrel_consensus_types::{
    block::SignedBlock,
    common::{BlockHash, Height, Round, StateHash, Timestamp},
};
use lru::LruCache;
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, VecDeque},
    num::NonZeroUsize,
    sync::Arc,
};
use tracing::debug;

#[cfg(test)]
#[path = "block_tree_test.rs"]
mod block_tree_test;

/// A block the tree holds but has not finalized.
#[derive(Clone, Debug)]
enum LiveBlock {
    /// Waiting for its parent to become alive.
    Pending(Arc<SignedBlock>),
    /// Executed and linked to the tree.
    Alive(Arc<BlockPointer>),
}

/// Entry of the pending min-queue. The queue may hold entries whose block
/// was consumed or died since insertion; the pending-by-parent table is
/// authoritative and stale entries are skipped on pop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct PendingQueueEntry {
    round: Round,
    hash: BlockHash,
    parent: BlockHash,
}

/// The in-memory tree: live blocks by hash, the pending-block tables, the
/// dead cache, the finalized tail still in memory, and the height-indexed
/// branches of non-finalized alive blocks.
pub struct BlockTree {
    live: HashMap<BlockHash, LiveBlock>,
    /// Recently rejected or pruned hashes, bounded FIFO. Lookups use
    /// `peek` so insertion order is eviction order.
    dead: LruCache<BlockHash, ()>,
    pending_by_parent: HashMap<BlockHash, Vec<Arc<SignedBlock>>>,
    pending_queue: BinaryHeap<Reverse<PendingQueueEntry>>,
    /// Finalized blocks still queryable without the store, newest last.
    recent_finalized: HashMap<BlockHash, Arc<BlockPointer>>,
    recent_finalized_order: VecDeque<BlockHash>,
    recent_finalized_limit: usize,
    last_finalized: Arc<BlockPointer>,
    /// The tip pending-transaction counters are projected from; always
    /// alive or finalized.
    focus_block: Arc<BlockPointer>,
    /// `branches[i]` holds the alive blocks at height
    /// `last_finalized.height + 1 + i`.
    branches: VecDeque<Vec<Arc<BlockPointer>>>,
}

impl BlockTree {
    pub fn new(root: Arc<BlockPointer>, dead_cache_size: usize, recent_finalized_limit: usize) -> Self {
        let capacity =
            NonZeroUsize::new(dead_cache_size.max(1)).expect("max(1) is non-zero");
        let mut tree = Self {
            live: HashMap::new(),
            dead: LruCache::new(capacity),
            pending_by_parent: HashMap::new(),
            pending_queue: BinaryHeap::new(),
            recent_finalized: HashMap::new(),
            recent_finalized_order: VecDeque::new(),
            recent_finalized_limit: recent_finalized_limit.max(1),
            last_finalized: root.clone(),
            focus_block: root.clone(),
            branches: VecDeque::new(),
        };
        tree.remember_finalized(root);
        tree
    }

    pub fn last_finalized(&self) -> &Arc<BlockPointer> {
        &self.last_finalized
    }

    pub fn focus_block(&self) -> &Arc<BlockPointer> {
        &self.focus_block
    }

    /// Memory-only status lookup; blocks finalized past the retained tail
    /// come back as `Unknown` and the store has the final word.
    pub fn block_status(&self, hash: &BlockHash) -> BlockStatus {
        match self.live.get(hash) {
            Some(LiveBlock::Pending(block)) => BlockStatus::Pending(block.clone()),
            Some(LiveBlock::Alive(pointer)) => BlockStatus::Alive(pointer.clone()),
            None => {
                if let Some(pointer) = self.recent_finalized.get(hash) {
                    BlockStatus::Finalized(pointer.clone())
                } else if self.dead.peek(hash).is_some() {
                    BlockStatus::Dead
                } else {
                    BlockStatus::Unknown
                }
            }
        }
    }

    /// The pointer for an alive or recently finalized block.
    pub fn get_live_or_finalized(&self, hash: &BlockHash) -> Option<Arc<BlockPointer>> {
        match self.block_status(hash) {
            BlockStatus::Alive(pointer) | BlockStatus::Finalized(pointer) => Some(pointer),
            _ => None,
        }
    }

    pub fn get_alive(&self, hash: &BlockHash) -> Option<Arc<BlockPointer>> {
        match self.live.get(hash) {
            Some(LiveBlock::Alive(pointer)) => Some(pointer.clone()),
            _ => None,
        }
    }

    /// Inserts a block whose parent is not alive yet: prepended to the
    /// parent's pending list and registered in the pending queue.
    pub fn add_pending_block(&mut self, block: Arc<SignedBlock>) {
        let entry = PendingQueueEntry {
            round: block.round(),
            hash: block.hash(),
            parent: block.parent(),
        };
        self.pending_by_parent
            .entry(block.parent())
            .or_default()
            .insert(0, block.clone());
        self.pending_queue.push(Reverse(entry));
        self.live.insert(block.hash(), LiveBlock::Pending(block));
        counters::PENDING_BLOCKS.set(self.pending_count() as i64);
    }

    /// Atomically removes and returns all pending children of `parent`.
    pub fn take_pending_children(&mut self, parent: &BlockHash) -> Vec<Arc<SignedBlock>> {
        let children = self.pending_by_parent.remove(parent).unwrap_or_default();
        for child in &children {
            self.live.remove(&child.hash());
        }
        counters::PENDING_BLOCKS.set(self.pending_count() as i64);
        children
    }

    /// Pops the pending block with the smallest round at most
    /// `target_round` whose presence the pending-by-parent table still
    /// witnesses. Stale queue entries are discarded silently.
    pub fn take_next_pending_until(&mut self, target_round: Round) -> Option<Arc<SignedBlock>> {
        while let Some(Reverse(entry)) = self.pending_queue.peek().copied() {
            if entry.round > target_round {
                return None;
            }
            self.pending_queue.pop();
            if let Some(block) = self.remove_pending_witness(&entry.parent, &entry.hash) {
                counters::PENDING_BLOCKS.set(self.pending_count() as i64);
                return Some(block);
            }
        }
        None
    }

    fn remove_pending_witness(
        &mut self,
        parent: &BlockHash,
        hash: &BlockHash,
    ) -> Option<Arc<SignedBlock>> {
        let siblings = self.pending_by_parent.get_mut(parent)?;
        let position = siblings.iter().position(|b| b.hash() == *hash)?;
        let block = siblings.remove(position);
        if siblings.is_empty() {
            self.pending_by_parent.remove(parent);
        }
        self.live.remove(hash);
        Some(block)
    }

    /// Replaces a pending record with an alive pointer at
    /// `parent.height + 1` and indexes it in the branches.
    pub fn make_live(
        &mut self,
        block: Arc<SignedBlock>,
        parent: &Arc<BlockPointer>,
        state_hash: StateHash,
        arrive_time: Timestamp,
    ) -> Arc<BlockPointer> {
        let pointer = BlockPointer::new(block, parent.height() + 1, state_hash, arrive_time);
        self.live
            .insert(pointer.hash(), LiveBlock::Alive(pointer.clone()));
        self.insert_branch(pointer.clone());
        counters::ALIVE_BLOCKS.set(self.alive_count() as i64);
        pointer
    }

    /// Removes from the live map (scrubbing any pending witness) and
    /// records the hash in the dead cache.
    pub fn mark_dead(&mut self, hash: &BlockHash) {
        match self.live.remove(hash) {
            Some(LiveBlock::Pending(block)) => {
                let parent = block.parent();
                self.remove_pending_witness(&parent, hash);
                // remove_pending_witness re-deletes from live; harmless.
            }
            Some(LiveBlock::Alive(pointer)) => {
                self.remove_branch(&pointer);
            }
            None => {}
        }
        self.dead.put(*hash, ());
        counters::PENDING_BLOCKS.set(self.pending_count() as i64);
        counters::ALIVE_BLOCKS.set(self.alive_count() as i64);
    }

    pub fn is_dead(&self, hash: &BlockHash) -> bool {
        self.dead.peek(hash).is_some()
    }

    pub fn set_focus(&mut self, pointer: Arc<BlockPointer>) {
        self.focus_block = pointer;
    }

    /// True iff `hash` is `ancestor` or descends from it through alive or
    /// recently finalized blocks.
    pub fn descends_from(&self, hash: &BlockHash, ancestor: &Arc<BlockPointer>) -> bool {
        let mut current = match self.get_live_or_finalized(hash) {
            Some(pointer) => pointer,
            None => return false,
        };
        while current.height() > ancestor.height() {
            current = match self.get_live_or_finalized(&current.parent()) {
                Some(pointer) => pointer,
                None => return false,
            };
        }
        current.hash() == ancestor.hash()
    }

    /// Alive blocks with no alive child.
    pub fn leaves(&self) -> Vec<Arc<BlockPointer>> {
        let mut is_parent: std::collections::HashSet<BlockHash> = std::collections::HashSet::new();
        for level in &self.branches {
            for pointer in level {
                is_parent.insert(pointer.parent());
            }
        }
        self.branches
            .iter()
            .flatten()
            .filter(|pointer| !is_parent.contains(&pointer.hash()))
            .cloned()
            .collect()
    }

    /// Alive non-leaf blocks.
    pub fn internal_branches(&self) -> Vec<Arc<BlockPointer>> {
        let mut is_parent: std::collections::HashSet<BlockHash> = std::collections::HashSet::new();
        for level in &self.branches {
            for pointer in level {
                is_parent.insert(pointer.parent());
            }
        }
        self.branches
            .iter()
            .flatten()
            .filter(|pointer| is_parent.contains(&pointer.hash()))
            .cloned()
            .collect()
    }

    /// All alive blocks at `height`.
    pub fn alive_at_height(&self, height: Height) -> Vec<Arc<BlockPointer>> {
        self.branch_index(height)
            .and_then(|index| self.branches.get(index))
            .cloned()
            .unwrap_or_default()
    }

    pub fn highest_alive_height(&self) -> Height {
        self.last_finalized.height() + self.branches.len() as Height
    }

    /// Finalizes `chain` (ascending heights, ending in the new last
    /// finalized block), prunes every alive block not descending from the
    /// new tip, and drains pending entries at or below its round.
    /// Returns the hashes that were marked dead.
    pub fn finalize_chain(&mut self, chain: &[Arc<BlockPointer>]) -> Vec<BlockHash> {
        let new_last = match chain.last() {
            Some(pointer) => pointer.clone(),
            None => return Vec::new(),
        };
        for pointer in chain {
            self.live.remove(&pointer.hash());
            self.remember_finalized(pointer.clone());
        }

        // Walk the branch levels: levels at or below the new finalized
        // height die unless they are the finalized chain itself; above it,
        // a block survives iff its parent did.
        let mut dead = Vec::new();
        let mut survivors: std::collections::HashSet<BlockHash> =
            std::collections::HashSet::new();
        survivors.insert(new_last.hash());
        let finalized: std::collections::HashSet<BlockHash> =
            chain.iter().map(|p| p.hash()).collect();
        let mut kept = VecDeque::new();
        let old_base = self.last_finalized.height();
        for (index, level) in std::mem::take(&mut self.branches).into_iter().enumerate() {
            let height = old_base + 1 + index as Height;
            if height <= new_last.height() {
                for pointer in level {
                    if !finalized.contains(&pointer.hash()) {
                        dead.push(pointer.hash());
                    }
                }
            } else {
                let mut surviving_level = Vec::new();
                for pointer in level {
                    if survivors.contains(&pointer.parent()) {
                        survivors.insert(pointer.hash());
                        surviving_level.push(pointer);
                    } else {
                        dead.push(pointer.hash());
                    }
                }
                kept.push_back(surviving_level);
            }
        }
        self.branches = kept;
        self.last_finalized = new_last.clone();

        for hash in &dead.clone() {
            self.mark_dead(hash);
        }

        // Pending blocks whose round the chain has passed can never join
        // the tree.
        while let Some(block) = self.take_next_pending_until(new_last.round()) {
            let hash = block.hash();
            debug!(block = %hash.short_str(), "dropping pending block behind finalization");
            self.mark_dead(&hash);
            dead.push(hash);
        }

        // Refocus when the previous focus fell on a pruned branch.
        if !self.descends_from(&self.focus_block.hash(), &new_last) {
            self.focus_block = new_last;
        }
        counters::ALIVE_BLOCKS.set(self.alive_count() as i64);
        dead
    }

    fn remember_finalized(&mut self, pointer: Arc<BlockPointer>) {
        self.recent_finalized_order.push_back(pointer.hash());
        self.recent_finalized.insert(pointer.hash(), pointer);
        while self.recent_finalized_order.len() > self.recent_finalized_limit {
            if let Some(old) = self.recent_finalized_order.pop_front() {
                self.recent_finalized.remove(&old);
            }
        }
    }

    fn insert_branch(&mut self, pointer: Arc<BlockPointer>) {
        let index = match self.branch_index(pointer.height()) {
            Some(index) => index,
            None => return,
        };
        while self.branches.len() <= index {
            self.branches.push_back(Vec::new());
        }
        self.branches[index].push(pointer);
    }

    fn remove_branch(&mut self, pointer: &Arc<BlockPointer>) {
        if let Some(index) = self.branch_index(pointer.height()) {
            if let Some(level) = self.branches.get_mut(index) {
                level.retain(|p| p.hash() != pointer.hash());
            }
        }
    }

    fn branch_index(&self, height: Height) -> Option<usize> {
        height
            .checked_sub(self.last_finalized.height() + 1)
            .map(|offset| offset as usize)
    }

    fn pending_count(&self) -> usize {
        self.pending_by_parent.values().map(Vec::len).sum()
    }

    fn alive_count(&self) -> usize {
        self.branches.iter().map(Vec::len).sum()
    }
}
