// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Misbehaviour evidence. The engine only detects and reports; persisting
//! evidence for slashing is the flagging subsystem's business.

use crate::counters;
use kestrel_consensus_types::{
    quorum_message::QuorumMessage, timeout_message::TimeoutMessage,
};
use tracing::warn;

/// Protocol violations attributable to a specific finalizer.
#[derive(Clone, Debug)]
pub enum Misbehaviour {
    /// Two distinct quorum messages from one finalizer for one round.
    QuorumDoubleSigning {
        first: Box<QuorumMessage>,
        second: Box<QuorumMessage>,
    },
    /// Two distinct timeout messages from one finalizer for one round.
    TimeoutDoubleSigning {
        first: Box<TimeoutMessage>,
        second: Box<TimeoutMessage>,
    },
    /// A timeout message whose embedded quorum certificate fails
    /// verification.
    TimeoutMessageInvalidQC { message: Box<TimeoutMessage> },
}

impl Misbehaviour {
    pub fn kind(&self) -> &'static str {
        match self {
            Misbehaviour::QuorumDoubleSigning { .. } => "quorum_double_signing",
            Misbehaviour::TimeoutDoubleSigning { .. } => "timeout_double_signing",
            Misbehaviour::TimeoutMessageInvalidQC { .. } => "timeout_message_invalid_qc",
        }
    }
}

/// Sink for evidence.
pub trait MisbehaviourHandler: Send + Sync {
    fn flag(&self, misbehaviour: Misbehaviour);
}

/// Default handler: count and log.
pub struct LoggingMisbehaviourHandler;

impl MisbehaviourHandler for LoggingMisbehaviourHandler {
    fn flag(&self, misbehaviour: Misbehaviour) {
        counters::MISBEHAVIOUR_COUNT
            .with_label_values(&[misbehaviour.kind()])
            .inc();
        warn!(kind = misbehaviour.kind(), "flagging misbehaviour evidence");
    }
}
