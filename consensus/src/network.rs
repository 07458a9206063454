// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! The outbound message surface. Peer-to-peer transport, relaying and
//! banning are the network layer's business; consensus only multicasts.

use kestrel_consensus_types::{
    block::SignedBlock, catch_up::CatchUpMessage, quorum_message::QuorumMessage,
    timeout_message::TimeoutMessage,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Messages consensus sends to its peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMsg {
    Block(Arc<SignedBlock>),
    QuorumMessage(Box<QuorumMessage>),
    TimeoutMessage(Box<TimeoutMessage>),
    CatchUp(Box<CatchUpMessage>),
}

/// Multicast to all peers. Implementations must not block the consensus
/// context; sends are fire-and-forget.
pub trait BroadcastSender: Send + Sync {
    fn broadcast(&self, message: ConsensusMsg);
}
