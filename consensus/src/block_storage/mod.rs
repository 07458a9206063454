// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! The in-memory block tree and its disk-backed finalized tail.

mod block_pointer;
mod block_store;
mod block_tree;

pub use block_pointer::BlockPointer;
pub use block_store::BlockStore;
pub use block_tree::BlockTree;

use kestrel_consensus_types::block::SignedBlock;
use std::sync::Arc;

/// The status of a block the tree still has in memory.
#[derive(Clone, Debug)]
pub enum BlockStatus {
    /// Finalized and still held in memory.
    Finalized(Arc<BlockPointer>),
    /// In the tree, executed, not yet finalized.
    Alive(Arc<BlockPointer>),
    /// Received but waiting for its parent.
    Pending(Arc<SignedBlock>),
    /// Proven invalid or pruned; retained in the dead cache for
    /// de-duplication.
    Dead,
    /// Never seen.
    Unknown,
}

impl BlockStatus {
    pub fn is_known(&self) -> bool {
        !matches!(self, BlockStatus::Unknown)
    }
}

/// The status of any block, including those finalized so long ago that
/// only the block store remembers them.
#[derive(Clone, Debug)]
pub enum RecentBlockStatus {
    /// Finalized and evicted from memory; the store can produce it.
    OldFinalized,
    Recent(BlockStatus),
}
