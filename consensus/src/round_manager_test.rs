// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    block_storage::{BlockPointer, BlockStatus, RecentBlockStatus},
    evidence::Misbehaviour,
    test_utils::{BlockParams, TestNode, TestSetup},
    timer::RoundTimeoutEvent,
    UpdateResult,
};
use kestrel_consensus_types::{
    block::SignedBlock,
    common::{BlockHash, Epoch, Round},
    finalization_entry::FinalizationEntry,
    genesis::GenesisParameters,
    quorum_cert::QuorumCert,
};
use std::sync::Arc;

fn genesis_pointer(node: &TestNode) -> Arc<BlockPointer> {
    node.manager
        .block_store()
        .tree()
        .last_finalized()
        .clone()
}

fn alive(node: &TestNode, hash: &BlockHash) -> Arc<BlockPointer> {
    node.manager
        .block_store()
        .tree()
        .get_alive(hash)
        .expect("block is alive")
}

fn status(node: &TestNode, hash: &BlockHash) -> BlockStatus {
    node.manager.block_store().tree().block_status(hash)
}

/// Feeds quorum messages from the given finalizers for `block`.
fn feed_votes(
    node: &mut TestNode,
    setup: &TestSetup,
    block: BlockHash,
    round: Round,
    epoch: Epoch,
    finalizers: &[u32],
) {
    for finalizer in finalizers {
        let vote = setup.quorum_message(*finalizer, block, round, epoch);
        node.manager.process_quorum_message(vote);
    }
}

/// Feeds timeout messages referencing `qc` for `round`.
fn feed_timeouts(
    node: &mut TestNode,
    setup: &TestSetup,
    round: Round,
    epoch: Epoch,
    qc: &QuorumCert,
    finalizers: &[u32],
) {
    for finalizer in finalizers {
        let message = setup.timeout_message(*finalizer, round, epoch, qc.clone());
        node.manager.process_timeout_message(message);
    }
}

/// Builds and delivers the straight chain `b1..=count` on top of
/// genesis, returning the block hashes.
fn deliver_chain(node: &mut TestNode, setup: &TestSetup, count: u64) -> Vec<BlockHash> {
    let mut parent = genesis_pointer(node);
    let mut hashes = Vec::new();
    for round in 1..=count {
        let block = setup.make_block(BlockParams::child_of(&parent, round, round * 1_000));
        assert_eq!(
            node.manager.receive_block(block.clone()),
            UpdateResult::Success,
            "block for round {round} should be accepted"
        );
        hashes.push(block.hash());
        parent = alive(node, &block.hash());
    }
    hashes
}

#[test]
fn early_blocks_are_rejected_without_insertion() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(None);
    let root = genesis_pointer(&node);
    let horizon = node.time.now_ms.load(std::sync::atomic::Ordering::Relaxed)
        + node.manager.config.early_block_threshold_ms;
    let block = setup.make_block(BlockParams::child_of(&root, 1, horizon + 1));

    assert_eq!(node.manager.receive_block(block.clone()), UpdateResult::EarlyBlock);
    assert!(matches!(
        node.manager
            .block_store()
            .get_recent_block_status(&block.hash())
            .unwrap(),
        RecentBlockStatus::Recent(BlockStatus::Unknown)
    ));
}

#[test]
fn timestamp_at_finalized_boundary_is_stale() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(None);
    let root = genesis_pointer(&node);
    // Equal to the last finalized timestamp: stale. One past: accepted.
    let stale = setup.make_block(BlockParams::child_of(&root, 1, 0));
    assert_eq!(node.manager.receive_block(stale.clone()), UpdateResult::Stale);
    assert!(matches!(status(&node, &stale.hash()), BlockStatus::Dead));

    let fresh = setup.make_block(BlockParams::child_of(&root, 1, 1));
    assert_eq!(node.manager.receive_block(fresh), UpdateResult::Success);
}

#[test]
fn duplicate_blocks_are_reported() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(None);
    let root = genesis_pointer(&node);
    let block = setup.make_block(BlockParams::child_of(&root, 1, 1_000));

    assert_eq!(node.manager.receive_block(block.clone()), UpdateResult::Success);
    assert_eq!(node.manager.receive_block(block), UpdateResult::Duplicate);
}

#[test]
fn shutdown_stops_message_processing() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(None);
    let root = genesis_pointer(&node);
    node.manager.shutdown();
    let block = setup.make_block(BlockParams::child_of(&root, 1, 1_000));
    assert_eq!(
        node.manager.receive_block(block),
        UpdateResult::ConsensusShutDown
    );
}

#[test]
fn out_of_order_blocks_wait_for_their_parent() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(None);
    let root = genesis_pointer(&node);
    let b1 = setup.make_block(BlockParams::child_of(&root, 1, 1_000));
    let b1_pointer = BlockPointer::new(
        b1.clone(),
        1,
        crate::test_utils::MockStateComputer::compute(&root.state_hash(), 1, 1_000, &[])
            .state_hash,
        1_000,
    );
    let b2 = setup.make_block(BlockParams::child_of(&b1_pointer, 2, 2_000));

    assert_eq!(node.manager.receive_block(b2.clone()), UpdateResult::PendingBlock);
    assert!(matches!(status(&node, &b2.hash()), BlockStatus::Pending(_)));

    // The parent arrives and the child is promoted in the same call; the
    // child's embedded certificate advances the round past its parent.
    assert_eq!(node.manager.receive_block(b1.clone()), UpdateResult::Success);
    assert!(matches!(status(&node, &b1.hash()), BlockStatus::Alive(_)));
    assert!(matches!(status(&node, &b2.hash()), BlockStatus::Alive(_)));
    assert_eq!(node.manager.current_round(), 2);
}

#[test]
fn tampered_blocks_are_marked_dead() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(None);
    let root = genesis_pointer(&node);
    let good = setup.make_block(BlockParams::child_of(&root, 1, 1_000));
    // Re-sign the same data with a key that is not the leader's.
    let outsider = kestrel_consensus_types::signer::ConsensusSigner::random(99);
    let forged = Arc::new(SignedBlock::sign(good.data().clone(), outsider.block_key()));

    assert_eq!(node.manager.receive_block(forged.clone()), UpdateResult::Invalid);
    assert!(matches!(status(&node, &forged.hash()), BlockStatus::Dead));
}

#[test]
fn quorum_votes_form_certificate_and_advance_round() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(None);
    let hashes = deliver_chain(&mut node, &setup, 1);
    assert_eq!(node.manager.current_round(), 1);

    feed_votes(&mut node, &setup, hashes[0], 1, 0, &[0, 1]);
    // Two of four is short of the two-thirds threshold.
    assert_eq!(node.manager.current_round(), 1);

    feed_votes(&mut node, &setup, hashes[0], 1, 0, &[2]);
    assert_eq!(node.manager.current_round(), 2);
    assert_eq!(node.manager.round_state.highest_certified().round(), 1);
    assert_eq!(node.manager.round_state.highest_certified().block(), hashes[0]);
}

#[test]
fn chained_certificates_finalize_blocks() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(None);
    let hashes = deliver_chain(&mut node, &setup, 3);

    // b3 carried the certificate for b2; two consecutive certified
    // rounds finalize b1.
    let tree = node.manager.block_store().tree();
    assert_eq!(tree.last_finalized().hash(), hashes[0]);
    assert_eq!(node.manager.current_round(), 3);

    // Certifying b3 finalizes b2 as well.
    feed_votes(&mut node, &setup, hashes[2], 3, 0, &[0, 1, 2]);
    let tree = node.manager.block_store().tree();
    assert_eq!(tree.last_finalized().hash(), hashes[1]);
    assert_eq!(node.manager.current_round(), 4);

    // The finalized chain is persisted by height.
    let stored = node
        .storage
        .finalized_block_at_height(2)
        .unwrap()
        .expect("height 2 finalized");
    assert_eq!(stored.hash(), hashes[1]);
    assert_eq!(node.storage.finalized_height_of(&hashes[0]).unwrap(), Some(1));
}

#[test]
fn double_votes_are_flagged_as_evidence() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(None);
    let first = setup.quorum_message(1, kestrel_crypto::HashValue::sha256(b"a"), 1, 0);
    let second = setup.quorum_message(1, kestrel_crypto::HashValue::sha256(b"b"), 1, 0);

    assert_eq!(node.manager.process_quorum_message(first), UpdateResult::Success);
    assert_eq!(node.manager.process_quorum_message(second), UpdateResult::Invalid);
    let flagged = node.misbehaviour.flagged.lock().unwrap();
    assert!(matches!(
        flagged.as_slice(),
        [Misbehaviour::QuorumDoubleSigning { .. }]
    ));
}

#[test]
fn timeout_certificates_advance_successive_rounds() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(None);
    let genesis_qc = QuorumCert::genesis(setup.genesis_hash);

    feed_timeouts(&mut node, &setup, 1, 0, &genesis_qc, &[0, 1]);
    assert_eq!(node.manager.current_round(), 1);
    feed_timeouts(&mut node, &setup, 1, 0, &genesis_qc, &[2]);
    assert_eq!(node.manager.current_round(), 2);
    let timeout = node
        .manager
        .round_state
        .previous_round_timeout()
        .expect("round 1 timed out");
    assert_eq!(timeout.cert.round(), 1);

    // A fourth vote for the finished round is stale now.
    let late = setup.timeout_message(3, 1, 0, genesis_qc.clone());
    assert_eq!(node.manager.process_timeout_message(late), UpdateResult::Stale);

    feed_timeouts(&mut node, &setup, 2, 0, &genesis_qc, &[0, 1, 2]);
    assert_eq!(node.manager.current_round(), 3);
    let timeout = node
        .manager
        .round_state
        .previous_round_timeout()
        .expect("round 2 timed out");
    assert_eq!(timeout.cert.round(), 2);
}

#[test]
fn competing_branch_dies_when_the_other_finalizes() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(None);
    let hashes = deliver_chain(&mut node, &setup, 3);
    let b2_pointer = alive(&node, &hashes[1]);

    // Round 3 times out instead of certifying b3.
    let qc_b2 = setup.make_qc(hashes[1], 2, 0);
    feed_timeouts(&mut node, &setup, 3, 0, &qc_b2, &[0, 1, 2]);
    assert_eq!(node.manager.current_round(), 4);
    let tc = node
        .manager
        .round_state
        .previous_round_timeout()
        .expect("round 3 timed out")
        .cert
        .clone();

    // The round-4 leader rebuilds on b2, skipping b3.
    let b4 = setup.make_block(BlockParams {
        timeout_cert: Some(tc),
        ..BlockParams::child_of(&b2_pointer, 4, 4_000)
    });
    assert_eq!(node.manager.receive_block(b4.clone()), UpdateResult::Success);

    // Certifying b4 does not finalize: rounds 2 and 4 are not
    // consecutive.
    feed_votes(&mut node, &setup, b4.hash(), 4, 0, &[0, 1, 2]);
    assert_eq!(node.manager.current_round(), 5);
    assert_eq!(
        node.manager.block_store().tree().last_finalized().hash(),
        hashes[0]
    );
    assert!(matches!(status(&node, &hashes[2]), BlockStatus::Alive(_)));

    // One consecutive round on top settles it: b2 and b4 finalize, b3
    // dies with its branch.
    let b4_pointer = alive(&node, &b4.hash());
    let b5 = setup.make_block(BlockParams::child_of(&b4_pointer, 5, 5_000));
    assert_eq!(node.manager.receive_block(b5.clone()), UpdateResult::Success);
    feed_votes(&mut node, &setup, b5.hash(), 5, 0, &[0, 1, 2]);

    let tree = node.manager.block_store().tree();
    assert_eq!(tree.last_finalized().hash(), b4.hash());
    assert!(matches!(status(&node, &hashes[1]), BlockStatus::Finalized(_)));
    assert!(matches!(status(&node, &hashes[2]), BlockStatus::Dead));
}

#[test]
fn local_timeout_grows_and_persists_the_round_status() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(Some(0));
    assert_eq!(node.time.last_schedule().expect("armed at open").0, 1);

    node.manager.upon_timeout_event(RoundTimeoutEvent { round: 1 });

    // Grown by the genesis factor 3/2 and re-armed.
    let (round, duration) = node.time.last_schedule().unwrap();
    assert_eq!(round, 1);
    assert_eq!(duration.as_millis(), 15_000);
    let signed = node
        .manager
        .round_state
        .status()
        .last_signed_timeout_message
        .clone()
        .expect("timeout message signed");
    assert_eq!(signed.round(), 1);

    // A stale timer fire changes nothing.
    let before = node.time.schedules.lock().unwrap().len();
    node.manager.upon_timeout_event(RoundTimeoutEvent { round: 0 });
    assert_eq!(node.time.schedules.lock().unwrap().len(), before);
}

#[test]
fn round_status_survives_restart() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(Some(0));
    let genesis_qc = QuorumCert::genesis(setup.genesis_hash);

    node.manager.upon_timeout_event(RoundTimeoutEvent { round: 1 });
    feed_timeouts(&mut node, &setup, 1, 0, &genesis_qc, &[1, 2]);
    assert_eq!(node.manager.current_round(), 2);
    node.manager.close().unwrap();

    drop(node.manager);
    drop(node.storage);
    let dir = node.dir;

    let restarted = setup.node_in(dir, Some(0));
    assert_eq!(restarted.manager.current_round(), 2);
    assert!(restarted
        .manager
        .round_state
        .previous_round_timeout()
        .is_some());
    // The timer is re-armed from the persisted, grown timeout.
    let (round, duration) = restarted.time.last_schedule().expect("armed at open");
    assert_eq!(round, 2);
    assert_eq!(duration.as_millis(), 15_000);
}

#[test]
fn finalization_entry_carries_the_epoch_transition() {
    let setup = TestSetup::with_parameters(
        4,
        GenesisParameters {
            timestamp: 0,
            epoch_duration_ms: 1_000,
            ..TestSetup::new(1).genesis.parameters
        },
    );
    let mut node = setup.node(None);
    let root = genesis_pointer(&node);

    let b1 = setup.make_block(BlockParams::child_of(&root, 1, 1_500));
    assert_eq!(node.manager.receive_block(b1.clone()), UpdateResult::Success);
    let b1_pointer = alive(&node, &b1.hash());
    let b2 = setup.make_block(BlockParams::child_of(&b1_pointer, 2, 1_600));
    assert_eq!(node.manager.receive_block(b2.clone()), UpdateResult::Success);
    let b2_pointer = alive(&node, &b2.hash());

    // The entry finalizing b1 crosses the epoch boundary at t=1000; the
    // round-3 block rides it into epoch 1.
    let entry = FinalizationEntry::new(
        setup.make_qc(b1.hash(), 1, 0),
        setup.make_qc(b2.hash(), 2, 0),
    );
    let b3 = setup.make_block(BlockParams {
        epoch: 1,
        entries: &[&entry],
        ..BlockParams::child_of(&b2_pointer, 3, 1_700)
    });
    assert_eq!(node.manager.receive_block(b3.clone()), UpdateResult::Success);

    assert_eq!(node.manager.current_epoch(), 1);
    assert_eq!(node.manager.current_round(), 3);
    assert_eq!(
        node.manager.block_store().tree().last_finalized().hash(),
        b1.hash()
    );
    // The new epoch's leadership nonce is durable for recovery.
    assert!(node.storage.epoch_nonce(1).unwrap().is_some());
}
