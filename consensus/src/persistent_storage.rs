// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Disk-backed consensus state.
//!
//! Layout: one column family for small metadata records (round status,
//! latest finalization entry, genesis), one for finalized blocks keyed by
//! big-endian height, and one mapping block hash to height. The round
//! status and every finalization batch are written with a synchronous
//! write so the invariants they witness survive crashes.

use crate::{block_storage::BlockPointer, liveness::round_state::RoundStatus};
use kestrel_consensus_types::{
    block::SignedBlock,
    common::{BlockHash, Height, StateHash, Timestamp},
    finalization_entry::FinalizationEntry,
};
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::{path::Path, sync::Arc};
use thiserror::Error;

const CF_METADATA: &str = "metadata";
const CF_BLOCKS: &str = "finalized_blocks";
const CF_BLOCK_INDEX: &str = "block_height_index";

const KEY_ROUND_STATUS: &[u8] = b"round_status";
const KEY_LATEST_FINALIZATION_ENTRY: &[u8] = b"latest_finalization_entry";
const KEY_GENESIS: &[u8] = b"genesis";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] rocksdb::Error),
    #[error("missing column family {0}")]
    MissingColumnFamily(&'static str),
    /// Malformed bytes in the store are not recoverable in the consensus
    /// context; callers terminate on this.
    #[error("corrupted record under {context}: {message}")]
    Corrupted {
        context: &'static str,
        message: String,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A finalized block as kept in the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredBlock {
    Genesis {
        hash: BlockHash,
        timestamp: Timestamp,
        state_hash: StateHash,
    },
    Block {
        block: SignedBlock,
        height: Height,
        state_hash: StateHash,
    },
}

impl StoredBlock {
    pub fn hash(&self) -> BlockHash {
        match self {
            StoredBlock::Genesis { hash, .. } => *hash,
            StoredBlock::Block { block, .. } => block.hash(),
        }
    }

    pub fn height(&self) -> Height {
        match self {
            StoredBlock::Genesis { .. } => 0,
            StoredBlock::Block { height, .. } => *height,
        }
    }

    pub fn state_hash(&self) -> StateHash {
        match self {
            StoredBlock::Genesis { state_hash, .. } => *state_hash,
            StoredBlock::Block { state_hash, .. } => *state_hash,
        }
    }

    pub fn from_pointer(pointer: &BlockPointer) -> Self {
        match pointer.block() {
            None => StoredBlock::Genesis {
                hash: pointer.hash(),
                timestamp: pointer.timestamp(),
                state_hash: pointer.state_hash(),
            },
            Some(block) => StoredBlock::Block {
                block: block.as_ref().clone(),
                height: pointer.height(),
                state_hash: pointer.state_hash(),
            },
        }
    }

    pub fn into_pointer(self) -> Arc<BlockPointer> {
        match self {
            StoredBlock::Genesis {
                hash,
                timestamp,
                state_hash,
            } => BlockPointer::genesis(hash, timestamp, state_hash),
            StoredBlock::Block {
                block,
                height,
                state_hash,
            } => {
                let arrive_time = block.timestamp();
                BlockPointer::new(Arc::new(block), height, state_hash, arrive_time)
            }
        }
    }
}

/// Handle to the consensus database. Single writer: the consensus context
/// owns all mutations; catch-up streaming reads concurrently.
pub struct PersistentStorage {
    db: DB,
}

impl PersistentStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);
        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_BLOCK_INDEX, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&options, path, cfs)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &'static str) -> StorageResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or(StorageError::MissingColumnFamily(name))
    }

    fn sync_writes() -> WriteOptions {
        let mut options = WriteOptions::default();
        options.set_sync(true);
        options
    }

    fn decode<T: for<'de> Deserialize<'de>>(
        context: &'static str,
        bytes: &[u8],
    ) -> StorageResult<T> {
        bcs::from_bytes(bytes).map_err(|error| StorageError::Corrupted {
            context,
            message: error.to_string(),
        })
    }

    /// Records the genesis hash the database belongs to. Refuses to
    /// adopt a database initialized for a different chain.
    pub fn init_genesis(&self, genesis_hash: &BlockHash) -> StorageResult<()> {
        let metadata = self.cf(CF_METADATA)?;
        match self.db.get_cf(metadata, KEY_GENESIS)? {
            Some(bytes) => {
                let stored: BlockHash = Self::decode("genesis", &bytes)?;
                if stored != *genesis_hash {
                    return Err(StorageError::Corrupted {
                        context: "genesis",
                        message: format!(
                            "database belongs to chain {stored}, not {genesis_hash}"
                        ),
                    });
                }
                Ok(())
            }
            None => {
                let bytes = bcs::to_bytes(genesis_hash).expect("hash serializes");
                self.db
                    .put_cf_opt(metadata, KEY_GENESIS, bytes, &Self::sync_writes())?;
                Ok(())
            }
        }
    }

    pub fn round_status(&self) -> StorageResult<Option<RoundStatus>> {
        let metadata = self.cf(CF_METADATA)?;
        match self.db.get_cf(metadata, KEY_ROUND_STATUS)? {
            Some(bytes) => Ok(Some(Self::decode("round status", &bytes)?)),
            None => Ok(None),
        }
    }

    /// Synchronously persists the round status. Must complete before any
    /// message derived from the new round leaves the engine.
    pub fn write_round_status(&self, status: &RoundStatus) -> StorageResult<()> {
        let metadata = self.cf(CF_METADATA)?;
        let bytes = bcs::to_bytes(status).expect("round status serializes");
        self.db
            .put_cf_opt(metadata, KEY_ROUND_STATUS, bytes, &Self::sync_writes())?;
        Ok(())
    }

    /// Atomically appends newly finalized blocks and the entry that
    /// finalized them.
    pub fn write_finalized(
        &self,
        blocks: &[StoredBlock],
        entry: &FinalizationEntry,
    ) -> StorageResult<()> {
        let blocks_cf = self.cf(CF_BLOCKS)?;
        let index_cf = self.cf(CF_BLOCK_INDEX)?;
        let metadata = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        for block in blocks {
            let height_key = block.height().to_be_bytes();
            let bytes = bcs::to_bytes(block).expect("stored block serializes");
            batch.put_cf(blocks_cf, height_key, bytes);
            batch.put_cf(index_cf, block.hash().as_slice(), height_key);
        }
        let entry_bytes = bcs::to_bytes(entry).expect("finalization entry serializes");
        batch.put_cf(metadata, KEY_LATEST_FINALIZATION_ENTRY, entry_bytes);
        self.db.write_opt(batch, &Self::sync_writes())?;
        Ok(())
    }

    /// Writes the genesis block itself (height 0), outside any
    /// finalization entry.
    pub fn write_genesis_block(&self, block: &StoredBlock) -> StorageResult<()> {
        let blocks_cf = self.cf(CF_BLOCKS)?;
        let index_cf = self.cf(CF_BLOCK_INDEX)?;
        let mut batch = WriteBatch::default();
        let height_key = block.height().to_be_bytes();
        let bytes = bcs::to_bytes(block).expect("stored block serializes");
        batch.put_cf(blocks_cf, height_key, bytes);
        batch.put_cf(index_cf, block.hash().as_slice(), height_key);
        self.db.write_opt(batch, &Self::sync_writes())?;
        Ok(())
    }

    pub fn finalized_block_at_height(&self, height: Height) -> StorageResult<Option<StoredBlock>> {
        let blocks_cf = self.cf(CF_BLOCKS)?;
        match self.db.get_cf(blocks_cf, height.to_be_bytes())? {
            Some(bytes) => Ok(Some(Self::decode("finalized block", &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn finalized_height_of(&self, hash: &BlockHash) -> StorageResult<Option<Height>> {
        let index_cf = self.cf(CF_BLOCK_INDEX)?;
        match self.db.get_cf(index_cf, hash.as_slice())? {
            Some(bytes) => {
                let array: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StorageError::Corrupted {
                        context: "block height index",
                        message: format!("{} bytes where 8 expected", bytes.len()),
                    }
                })?;
                Ok(Some(Height::from_be_bytes(array)))
            }
            None => Ok(None),
        }
    }

    /// The finalized block with the greatest height.
    pub fn last_finalized_block(&self) -> StorageResult<Option<StoredBlock>> {
        let blocks_cf = self.cf(CF_BLOCKS)?;
        let mut iter = self.db.iterator_cf(blocks_cf, IteratorMode::End);
        match iter.next() {
            Some(entry) => {
                let (_, bytes) = entry?;
                Ok(Some(Self::decode("finalized block", &bytes)?))
            }
            None => Ok(None),
        }
    }

    /// Persists the leadership nonce seated for `epoch`, so recovery can
    /// rebuild the retained epoch window without replaying entries.
    pub fn write_epoch_nonce(
        &self,
        epoch: u64,
        nonce: &kestrel_crypto::HashValue,
    ) -> StorageResult<()> {
        let metadata = self.cf(CF_METADATA)?;
        let mut key = b"epoch_nonce/".to_vec();
        key.extend_from_slice(&epoch.to_be_bytes());
        let bytes = bcs::to_bytes(nonce).expect("hash serializes");
        self.db
            .put_cf_opt(metadata, key, bytes, &Self::sync_writes())?;
        Ok(())
    }

    pub fn epoch_nonce(&self, epoch: u64) -> StorageResult<Option<kestrel_crypto::HashValue>> {
        let metadata = self.cf(CF_METADATA)?;
        let mut key = b"epoch_nonce/".to_vec();
        key.extend_from_slice(&epoch.to_be_bytes());
        match self.db.get_cf(metadata, key)? {
            Some(bytes) => Ok(Some(Self::decode("epoch nonce", &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn latest_finalization_entry(&self) -> StorageResult<Option<FinalizationEntry>> {
        let metadata = self.cf(CF_METADATA)?;
        match self.db.get_cf(metadata, KEY_LATEST_FINALIZATION_ENTRY)? {
            Some(bytes) => Ok(Some(Self::decode("finalization entry", &bytes)?)),
            None => Ok(None),
        }
    }

    /// Flushes everything to disk; part of orderly shutdown.
    pub fn close(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PersistentStorage::open(dir.path()).unwrap();
        let genesis = BlockHash::sha256(b"chain-a");
        storage.init_genesis(&genesis).unwrap();
        storage.init_genesis(&genesis).unwrap();
        let other = BlockHash::sha256(b"chain-b");
        assert!(storage.init_genesis(&other).is_err());
    }

    #[test]
    fn finalized_blocks_round_trip_by_height_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PersistentStorage::open(dir.path()).unwrap();
        let genesis = StoredBlock::Genesis {
            hash: BlockHash::sha256(b"genesis"),
            timestamp: 0,
            state_hash: BlockHash::sha256(b"state0"),
        };
        storage.write_genesis_block(&genesis).unwrap();

        let read = storage.finalized_block_at_height(0).unwrap().unwrap();
        assert_eq!(read, genesis);
        assert_eq!(
            storage.finalized_height_of(&genesis.hash()).unwrap(),
            Some(0)
        );
        assert_eq!(storage.last_finalized_block().unwrap().unwrap(), genesis);
        assert_eq!(storage.finalized_block_at_height(1).unwrap(), None);
    }
}
