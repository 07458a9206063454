// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Capability traits for the external collaborators consensus drives:
//! block execution and transaction supply.

use kestrel_consensus_types::common::{
    BlockHash, OutcomesHash, Round, StateHash, Timestamp, Transaction,
};
use thiserror::Error;

/// Result of executing a block's transactions on top of its parent state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutedState {
    pub state_hash: StateHash,
    pub outcomes_hash: OutcomesHash,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("block execution failed: {0}")]
    Failed(String),
}

/// Executes a block's transactions over the parent state and reports the
/// resulting hashes. Used both to validate received blocks against their
/// claimed hashes and to compute the claims of a block being produced.
/// Pure from consensus's perspective: no retries, no partial effects
/// visible to the tree.
pub trait StateComputer: Send + Sync {
    fn execute(
        &self,
        parent_state: &StateHash,
        round: Round,
        timestamp: Timestamp,
        transactions: &[Transaction],
    ) -> Result<ExecutedState, ExecutionError>;
}

/// Supplies the transaction list for a block produced by the local baker
/// and tracks which tip pending-transaction bookkeeping projects from.
pub trait PayloadProvider: Send + Sync {
    /// Transactions to include in a proposal built on `parent`.
    fn get_payload(&self, parent: &BlockHash) -> Vec<Transaction>;

    /// The focus block changed; pending-transaction counters should be
    /// re-projected from `new_focus`.
    fn focus_changed(&self, new_focus: &BlockHash);
}
