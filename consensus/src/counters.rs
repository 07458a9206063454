// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

/// Current round of the consensus engine.
pub static CURRENT_ROUND: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "kestrel_consensus_current_round",
        "Current round of the consensus engine"
    )
    .expect("metric registers")
});

/// Current epoch of the consensus engine.
pub static CURRENT_EPOCH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "kestrel_consensus_current_epoch",
        "Current epoch of the consensus engine"
    )
    .expect("metric registers")
});

/// Round of the last finalized block.
pub static LAST_FINALIZED_ROUND: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "kestrel_consensus_last_finalized_round",
        "Round of the last finalized block"
    )
    .expect("metric registers")
});

/// Height of the last finalized block.
pub static LAST_FINALIZED_HEIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "kestrel_consensus_last_finalized_height",
        "Height of the last finalized block"
    )
    .expect("metric registers")
});

/// Total number of blocks finalized since start.
pub static FINALIZED_BLOCKS_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "kestrel_consensus_finalized_blocks_count",
        "Number of blocks finalized since start"
    )
    .expect("metric registers")
});

/// Rounds entered because a quorum certificate formed.
pub static QC_ROUNDS_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "kestrel_consensus_qc_rounds_count",
        "Rounds entered via a quorum certificate"
    )
    .expect("metric registers")
});

/// Rounds entered because a timeout certificate formed.
pub static TIMEOUT_ROUNDS_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "kestrel_consensus_timeout_rounds_count",
        "Rounds entered via a timeout certificate"
    )
    .expect("metric registers")
});

/// Current per-round timeout in milliseconds.
pub static ROUND_TIMEOUT_MS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "kestrel_consensus_round_timeout_ms",
        "Current per-round timeout in milliseconds"
    )
    .expect("metric registers")
});

/// Number of blocks waiting for their parent.
pub static PENDING_BLOCKS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "kestrel_consensus_pending_blocks",
        "Blocks waiting for their parent to become live"
    )
    .expect("metric registers")
});

/// Number of alive non-finalized blocks.
pub static ALIVE_BLOCKS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "kestrel_consensus_alive_blocks",
        "Alive non-finalized blocks in the tree"
    )
    .expect("metric registers")
});

/// Blocks marked dead, by cause.
pub static DEAD_BLOCKS_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kestrel_consensus_dead_blocks_count",
        "Blocks marked dead, by cause",
        &["cause"]
    )
    .expect("metric registers")
});

/// Blocks produced by the local baker.
pub static PROPOSED_BLOCKS_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "kestrel_consensus_proposed_blocks_count",
        "Blocks produced by the local baker"
    )
    .expect("metric registers")
});

/// Blocks streamed out in catch-up responses.
pub static CATCHUP_BLOCKS_SENT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "kestrel_consensus_catchup_blocks_sent",
        "Blocks streamed out in catch-up responses"
    )
    .expect("metric registers")
});

/// Misbehaviour evidence raised, by kind.
pub static MISBEHAVIOUR_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kestrel_consensus_misbehaviour_count",
        "Misbehaviour evidence raised, by kind",
        &["kind"]
    )
    .expect("metric registers")
});
