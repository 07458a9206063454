// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! The Kestrel round-based BFT consensus engine.
//!
//! The engine drives an unbounded sequence of numbered rounds, each
//! attempting to certify at most one block. Rounds advance on a quorum
//! certificate for the previous round or on a timeout certificate when the
//! round's leader failed. Two consecutive certified rounds in one epoch
//! finalize a block; finalization entries crossing an epoch boundary
//! transition the committee to the next epoch.
//!
//! All state mutation happens on a single logical execution context: the
//! [`round_manager::RoundManager`] consumes one event at a time from its
//! event loop. Cryptography is pure and delegated to `kestrel-crypto`;
//! execution, networking and timers are reached through the capability
//! traits in [`state_replication`], [`network`] and [`timer`].

#![deny(unsafe_code)]

pub mod block_export;
pub mod block_storage;
pub mod catchup;
pub mod config;
pub mod counters;
pub mod epoch_state;
pub mod evidence;
pub mod finality;
pub mod liveness;
pub mod network;
pub mod persistent_storage;
pub mod quorum_messages;
pub mod round_manager;
pub mod state_replication;
pub mod timeout_messages;
pub mod timer;

#[cfg(any(test, feature = "testing"))]
pub mod test_utils;

use serde::{Deserialize, Serialize};

/// Wire-visible outcome of handing a message to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateResult {
    /// Message accepted and applied.
    Success,
    /// Byte-identical message already known.
    Duplicate,
    /// Message is behind the last finalized state.
    Stale,
    /// Message failed validation.
    Invalid,
    /// Block stored pending its parent.
    PendingBlock,
    /// Block awaiting finalization of an ancestor.
    PendingFinalization,
    /// Block timestamp too far in the future.
    EarlyBlock,
    /// Engine is shut down; queries only.
    ConsensusShutDown,
    /// Message references state we do not have; request catch-up from the
    /// sender.
    CatchupRequired,
    /// Message could not be verified against any known committee.
    Unverifiable,
}
