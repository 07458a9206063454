// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! The persisted round status and the operations that advance it.
//!
//! Every mutation is written synchronously to the store before the
//! mutating call returns, so nothing derived from an advanced round can
//! leave the engine ahead of its durability.

use crate::{
    counters,
    persistent_storage::{PersistentStorage, StorageResult},
};
use kestrel_consensus_types::{
    common::{Epoch, Ratio, Round},
    quorum_cert::QuorumCert,
    quorum_message::QuorumMessage,
    timeout_cert::TimeoutCert,
    timeout_message::TimeoutMessage,
};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use tracing::info;

/// The record of a round that ended in a timeout: the certificate and the
/// highest certified block at that moment, both echoed into the next
/// block so laggards can verify the round advance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTimeout {
    pub cert: TimeoutCert,
    pub certified_block: QuorumCert,
}

/// The round state as persisted. Exclusively owned by [`RoundState`]; all
/// mutation goes through helpers that persist before returning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStatus {
    pub current_round: Round,
    pub current_epoch: Epoch,
    pub current_timeout_ms: u64,
    /// The quorum certificate with the greatest round seen so far.
    pub highest_certified: QuorumCert,
    /// Set iff the previous round ended in a timeout.
    pub previous_round_timeout: Option<RoundTimeout>,
    /// Restored on startup so the node never signs twice for one round
    /// across a crash.
    pub last_signed_quorum_message: Option<QuorumMessage>,
    pub last_signed_timeout_message: Option<TimeoutMessage>,
}

impl RoundStatus {
    pub fn initial(genesis_qc: QuorumCert, base_timeout_ms: u64) -> Self {
        Self {
            current_round: 1,
            current_epoch: 0,
            current_timeout_ms: base_timeout_ms,
            highest_certified: genesis_qc,
            previous_round_timeout: None,
            last_signed_quorum_message: None,
            last_signed_timeout_message: None,
        }
    }
}

/// Why a round was entered.
#[derive(Clone, Debug)]
pub enum AdvanceCause {
    /// A quorum certificate formed for the preceding round.
    Quorum(QuorumCert),
    /// A timeout certificate formed; carries the highest certified block
    /// alongside.
    Timeout {
        cert: TimeoutCert,
        highest_qc: QuorumCert,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NewRoundReason {
    QuorumCertified,
    Timeout,
}

/// Handed to the round manager after a round advance has been persisted;
/// drives the timer reset and the leader's block production.
#[derive(Clone, Debug)]
pub struct NewRoundEvent {
    pub round: Round,
    pub reason: NewRoundReason,
    pub timeout: Duration,
}

impl fmt::Display for NewRoundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NewRoundEvent(round: {}, reason: {:?}, timeout: {:?})",
            self.round, self.reason, self.timeout
        )
    }
}

/// Owner of the persisted round status.
pub struct RoundState {
    status: RoundStatus,
    storage: Arc<PersistentStorage>,
}

impl RoundState {
    /// Restores the persisted status, or seats the initial one and
    /// persists it.
    pub fn recover_or_init(
        storage: Arc<PersistentStorage>,
        genesis_qc: QuorumCert,
        base_timeout_ms: u64,
    ) -> StorageResult<Self> {
        let status = match storage.round_status()? {
            Some(status) => status,
            None => {
                let status = RoundStatus::initial(genesis_qc, base_timeout_ms);
                storage.write_round_status(&status)?;
                status
            }
        };
        counters::CURRENT_ROUND.set(status.current_round as i64);
        counters::CURRENT_EPOCH.set(status.current_epoch as i64);
        counters::ROUND_TIMEOUT_MS.set(status.current_timeout_ms as i64);
        Ok(Self { status, storage })
    }

    pub fn status(&self) -> &RoundStatus {
        &self.status
    }

    pub fn current_round(&self) -> Round {
        self.status.current_round
    }

    pub fn current_epoch(&self) -> Epoch {
        self.status.current_epoch
    }

    pub fn current_timeout(&self) -> Duration {
        Duration::from_millis(self.status.current_timeout_ms)
    }

    pub fn highest_certified(&self) -> &QuorumCert {
        &self.status.highest_certified
    }

    pub fn previous_round_timeout(&self) -> Option<&RoundTimeout> {
        self.status.previous_round_timeout.as_ref()
    }

    /// Enters `new_round`. The new status is durable before this returns;
    /// the caller then resets the timer and, when leading, produces a
    /// block.
    pub fn advance_round(
        &mut self,
        new_round: Round,
        cause: AdvanceCause,
    ) -> StorageResult<NewRoundEvent> {
        debug_assert!(new_round > self.status.current_round);
        let reason = match cause {
            AdvanceCause::Quorum(qc) => {
                if qc.round() > self.status.highest_certified.round() {
                    self.status.highest_certified = qc;
                }
                self.status.previous_round_timeout = None;
                NewRoundReason::QuorumCertified
            }
            AdvanceCause::Timeout { cert, highest_qc } => {
                self.status.previous_round_timeout = Some(RoundTimeout {
                    cert,
                    certified_block: highest_qc,
                });
                NewRoundReason::Timeout
            }
        };
        self.status.current_round = new_round;
        self.storage.write_round_status(&self.status)?;

        counters::CURRENT_ROUND.set(new_round as i64);
        match reason {
            NewRoundReason::QuorumCertified => counters::QC_ROUNDS_COUNT.inc(),
            NewRoundReason::Timeout => counters::TIMEOUT_ROUNDS_COUNT.inc(),
        }
        info!(round = new_round, reason = ?reason, "entering round");
        Ok(NewRoundEvent {
            round: new_round,
            reason,
            timeout: self.current_timeout(),
        })
    }

    /// Enters `new_epoch`. The leadership nonce recomputation and vote
    /// pool rotation live with their owners; this persists the epoch.
    pub fn advance_epoch(&mut self, new_epoch: Epoch) -> StorageResult<()> {
        debug_assert!(new_epoch > self.status.current_epoch);
        self.status.current_epoch = new_epoch;
        self.storage.write_round_status(&self.status)?;
        counters::CURRENT_EPOCH.set(new_epoch as i64);
        info!(epoch = new_epoch, "entering epoch");
        Ok(())
    }

    /// Grows the current timeout by `increase` and persists it. The floor
    /// is one millisecond; growth saturates at `u64::MAX`.
    pub fn grow_timeout(&mut self, increase: Ratio) -> StorageResult<Duration> {
        let grown = increase.apply(self.status.current_timeout_ms).max(1);
        self.status.current_timeout_ms = grown;
        self.storage.write_round_status(&self.status)?;
        counters::ROUND_TIMEOUT_MS.set(grown as i64);
        Ok(Duration::from_millis(grown))
    }

    /// Records a quorum certificate as highest iff its round strictly
    /// exceeds the previous highest. Returns whether it was recorded.
    pub fn update_highest_certified(&mut self, qc: QuorumCert) -> StorageResult<bool> {
        if qc.round() <= self.status.highest_certified.round() {
            return Ok(false);
        }
        self.status.highest_certified = qc;
        self.storage.write_round_status(&self.status)?;
        Ok(true)
    }

    pub fn set_last_signed_quorum_message(
        &mut self,
        message: QuorumMessage,
    ) -> StorageResult<()> {
        self.status.last_signed_quorum_message = Some(message);
        self.storage.write_round_status(&self.status)
    }

    pub fn set_last_signed_timeout_message(
        &mut self,
        message: TimeoutMessage,
    ) -> StorageResult<()> {
        self.status.last_signed_timeout_message = Some(message);
        self.storage.write_round_status(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistent_storage::PersistentStorage;
    use kestrel_crypto::HashValue;

    fn storage() -> (Arc<PersistentStorage>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Arc::new(PersistentStorage::open(dir.path()).unwrap()), dir)
    }

    fn genesis_qc() -> QuorumCert {
        QuorumCert::genesis(HashValue::sha256(b"genesis"))
    }

    #[test]
    fn initial_status_is_persisted_on_first_open() {
        let (storage, _dir) = storage();
        let state = RoundState::recover_or_init(storage.clone(), genesis_qc(), 5_000).unwrap();
        assert_eq!(state.current_round(), 1);
        assert_eq!(storage.round_status().unwrap().unwrap(), *state.status());
    }

    #[test]
    fn advance_round_is_durable_before_returning() {
        let (storage, _dir) = storage();
        let mut state = RoundState::recover_or_init(storage.clone(), genesis_qc(), 5_000).unwrap();
        state
            .advance_round(2, AdvanceCause::Quorum(genesis_qc()))
            .unwrap();

        let reread = RoundState::recover_or_init(storage, genesis_qc(), 5_000).unwrap();
        assert_eq!(reread.current_round(), 2);
        assert!(reread.previous_round_timeout().is_none());
    }

    #[test]
    fn timeout_growth_persists() {
        let (storage, _dir) = storage();
        let mut state =
            RoundState::recover_or_init(storage.clone(), genesis_qc(), 10_000).unwrap();
        let grown = state.grow_timeout(Ratio::new(3, 2)).unwrap();
        assert_eq!(grown, Duration::from_millis(15_000));

        let reread = RoundState::recover_or_init(storage, genesis_qc(), 10_000).unwrap();
        assert_eq!(reread.current_timeout(), Duration::from_millis(15_000));
    }

    #[test]
    fn timeout_growth_floors_at_one_millisecond() {
        let (storage, _dir) = storage();
        let mut state = RoundState::recover_or_init(storage, genesis_qc(), 0).unwrap();
        let grown = state.grow_timeout(Ratio::new(3, 2)).unwrap();
        assert_eq!(grown, Duration::from_millis(1));
    }
}
