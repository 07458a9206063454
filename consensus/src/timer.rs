// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! The round timer. One timeout is outstanding at a time; re-arming for a
//! new round supersedes the previous schedule, and a fire for a stale
//! round is ignored by the receiver.

use kestrel_consensus_types::common::{Round, Timestamp};
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::mpsc;

/// Time and timer capability handed to the engine.
pub trait TimeService: Send + Sync {
    /// Milliseconds since the unix epoch.
    fn now(&self) -> Timestamp;

    /// Arrange for a timeout event naming `round` to be delivered after
    /// `duration`. A later call supersedes an earlier one.
    fn schedule_round_timeout(&self, round: Round, duration: Duration);
}

/// A timeout event as delivered into the consensus context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundTimeoutEvent {
    pub round: Round,
}

/// Production implementation: wall clock plus a tokio task per schedule.
/// Superseded schedules still fire but name a stale round, which the
/// round manager drops.
pub struct TokioTimeService {
    events: mpsc::UnboundedSender<RoundTimeoutEvent>,
}

impl TokioTimeService {
    pub fn new(events: mpsc::UnboundedSender<RoundTimeoutEvent>) -> Arc<Self> {
        Arc::new(Self { events })
    }
}

impl TimeService for TokioTimeService {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as Timestamp)
            .unwrap_or(0)
    }

    fn schedule_round_timeout(&self, round: Round, duration: Duration) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // Receiver may already be gone during shutdown.
            let _ = events.send(RoundTimeoutEvent { round });
        });
    }
}
