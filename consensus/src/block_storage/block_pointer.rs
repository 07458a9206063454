// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use kestrel_consensus_types::{
    block::SignedBlock,
    common::{BlockHash, Epoch, Height, Round, StateHash, Timestamp},
};
use std::{fmt, sync::Arc};

/// An executed block in the tree. Pointers are immutable and shared;
/// parent links go through the tree's hash index, never the other way
/// around, which keeps finalization's pruning pass local.
pub struct BlockPointer {
    hash: BlockHash,
    round: Round,
    epoch: Epoch,
    height: Height,
    timestamp: Timestamp,
    parent: BlockHash,
    /// State hash produced by executing the block (for genesis, the
    /// initial state).
    state_hash: StateHash,
    /// The underlying signed block; `None` only for genesis.
    block: Option<Arc<SignedBlock>>,
    /// Local receive time, for statistics.
    arrive_time: Timestamp,
}

impl BlockPointer {
    /// The root pointer for the genesis block. Genesis is its own parent.
    pub fn genesis(hash: BlockHash, timestamp: Timestamp, state_hash: StateHash) -> Arc<Self> {
        Arc::new(Self {
            hash,
            round: 0,
            epoch: 0,
            height: 0,
            timestamp,
            parent: hash,
            state_hash,
            block: None,
            arrive_time: timestamp,
        })
    }

    pub fn new(
        block: Arc<SignedBlock>,
        height: Height,
        state_hash: StateHash,
        arrive_time: Timestamp,
    ) -> Arc<Self> {
        Arc::new(Self {
            hash: block.hash(),
            round: block.round(),
            epoch: block.epoch(),
            height,
            timestamp: block.timestamp(),
            parent: block.parent(),
            state_hash,
            block: Some(block),
            arrive_time,
        })
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn parent(&self) -> BlockHash {
        self.parent
    }

    pub fn state_hash(&self) -> StateHash {
        self.state_hash
    }

    pub fn arrive_time(&self) -> Timestamp {
        self.arrive_time
    }

    pub fn is_genesis(&self) -> bool {
        self.block.is_none()
    }

    pub fn block(&self) -> Option<&Arc<SignedBlock>> {
        self.block.as_ref()
    }
}

impl fmt::Debug for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlockPointer({} round: {} epoch: {} height: {})",
            self.hash.short_str(),
            self.round,
            self.epoch,
            self.height
        )
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash.short_str())
    }
}
