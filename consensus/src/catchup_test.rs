// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    catchup::{
        handle_catch_up_request, is_catch_up_required, make_status,
        process_catch_up_terminal_data, CatchUpItem, TerminalDataResult,
    },
    test_utils::{BlockParams, TestNode, TestSetup},
    UpdateResult,
};
use kestrel_consensus_types::{
    block::SignedBlock,
    catch_up::{CatchUpStatus, CatchUpTerminalData},
    common::BlockHash,
    finalization_entry::FinalizationEntry,
    genesis::GenesisParameters,
};
use kestrel_crypto::HashValue;
use std::sync::Arc;

/// Delivers rounds 1..=3 on the node and certifies the tip, leaving the
/// node in round 4 with b2 finalized.
fn three_block_chain(node: &mut TestNode, setup: &TestSetup) -> Vec<BlockHash> {
    let mut parent = node.manager.block_store().tree().last_finalized().clone();
    let mut hashes = Vec::new();
    for round in 1..=3u64 {
        let block = setup.make_block(BlockParams::child_of(&parent, round, round * 1_000));
        assert_eq!(node.manager.receive_block(block.clone()), UpdateResult::Success);
        hashes.push(block.hash());
        parent = node
            .manager
            .block_store()
            .tree()
            .get_alive(&block.hash())
            .expect("alive");
    }
    for finalizer in 0..3u32 {
        let vote = setup.quorum_message(finalizer, hashes[2], 3, 0);
        node.manager.process_quorum_message(vote);
    }
    assert_eq!(node.manager.current_round(), 4);
    hashes
}

/// Pulls the producer dry, returning the streamed blocks and the
/// terminal data.
fn drain(
    mut producer: crate::catchup::CatchUpResponseProducer,
) -> (Vec<Arc<SignedBlock>>, CatchUpTerminalData) {
    let mut blocks = Vec::new();
    loop {
        match producer.next_item().expect("storage is healthy") {
            CatchUpItem::Block(block) => blocks.push(block),
            CatchUpItem::Done(terminal) => return (blocks, terminal),
        }
    }
}

fn behind_peer_status(last_finalized: BlockHash) -> CatchUpStatus {
    CatchUpStatus {
        last_finalized_block: last_finalized,
        last_finalized_round: 1,
        leaves: Vec::new(),
        branches: Vec::new(),
        current_round: 2,
        current_epoch: 0,
        quorum_signers: Vec::new(),
        timeout_summary: None,
    }
}

#[test]
fn behind_peer_receives_missing_blocks_and_terminal_data() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(None);
    let hashes = three_block_chain(&mut node, &setup);

    // A round-4 timeout vote sits in the pool when the request arrives.
    let timeout = setup.timeout_message(1, 4, 0, setup.make_qc(hashes[2], 3, 0));
    assert_eq!(
        node.manager.process_timeout_message(timeout.clone()),
        UpdateResult::Success
    );

    let producer =
        handle_catch_up_request(&node.manager, &behind_peer_status(hashes[0])).unwrap();
    let (blocks, terminal) = drain(producer);

    let streamed: Vec<BlockHash> = blocks.iter().map(|b| b.hash()).collect();
    assert_eq!(streamed, vec![hashes[1], hashes[2]]);

    assert_eq!(terminal.quorum_certs.len(), 1);
    assert_eq!(terminal.quorum_certs[0].block(), hashes[2]);
    assert_eq!(terminal.quorum_certs[0].round(), 3);
    assert!(terminal.timeout_cert.is_none());
    assert!(terminal.quorum_messages.is_empty());
    assert_eq!(terminal.timeout_messages, vec![timeout]);
}

#[test]
fn applying_a_full_response_is_a_contraction() {
    let setup = TestSetup::new(4);
    let mut responder = setup.node(None);
    let hashes = three_block_chain(&mut responder, &setup);
    let timeout = setup.timeout_message(1, 4, 0, setup.make_qc(hashes[2], 3, 0));
    responder.manager.process_timeout_message(timeout);

    let mut peer = setup.node(None);
    let peer_status = make_status(&peer.manager, false);
    assert!(is_catch_up_required(
        &make_status(&responder.manager, true),
        &peer.manager
    ));

    let producer = handle_catch_up_request(&responder.manager, &peer_status).unwrap();
    let (blocks, terminal) = drain(producer);
    for block in blocks {
        assert_eq!(peer.manager.receive_block(block), UpdateResult::Success);
    }
    assert_eq!(
        process_catch_up_terminal_data(&mut peer.manager, &terminal),
        TerminalDataResult::Success { progress: true }
    );

    assert_eq!(peer.manager.current_round(), responder.manager.current_round());
    assert_eq!(
        peer.manager.block_store().tree().last_finalized().hash(),
        responder.manager.block_store().tree().last_finalized().hash()
    );
    // Neither side needs the other any more.
    assert!(!is_catch_up_required(
        &make_status(&responder.manager, false),
        &peer.manager
    ));
    assert!(!is_catch_up_required(
        &make_status(&peer.manager, false),
        &responder.manager
    ));
}

#[test]
fn foreign_finalized_tip_gets_an_empty_response() {
    let setup = TestSetup::new(4);
    let mut node = setup.node(None);
    three_block_chain(&mut node, &setup);

    let producer = handle_catch_up_request(
        &node.manager,
        &behind_peer_status(HashValue::sha256(b"some other chain")),
    )
    .unwrap();
    let (blocks, terminal) = drain(producer);
    assert!(blocks.is_empty());
    assert!(terminal.is_empty());
}

#[test]
fn round_and_finalization_lags_trigger_catch_up() {
    let setup = TestSetup::new(4);
    let mut ahead = setup.node(None);
    three_block_chain(&mut ahead, &setup);
    let behind = setup.node(None);

    assert!(is_catch_up_required(
        &make_status(&ahead.manager, true),
        &behind.manager
    ));
    // The ahead node does not need the behind one.
    assert!(!is_catch_up_required(
        &make_status(&behind.manager, true),
        &ahead.manager
    ));
}

#[test]
fn missing_quorum_signatures_at_same_round_trigger_catch_up() {
    let setup = TestSetup::new(4);
    let mut full = setup.node(None);
    let root = full.manager.block_store().tree().last_finalized().clone();
    let b1 = setup.make_block(BlockParams::child_of(&root, 1, 1_000));
    assert_eq!(full.manager.receive_block(b1.clone()), UpdateResult::Success);
    for finalizer in [0u32, 1] {
        let vote = setup.quorum_message(finalizer, b1.hash(), 1, 0);
        assert_eq!(full.manager.process_quorum_message(vote), UpdateResult::Success);
    }

    let mut sparse = setup.node(None);
    assert_eq!(sparse.manager.receive_block(b1.clone()), UpdateResult::Success);
    let vote = setup.quorum_message(0, b1.hash(), 1, 0);
    assert_eq!(sparse.manager.process_quorum_message(vote), UpdateResult::Success);

    // Same round, same tree, but the full node holds a vote the sparse
    // one is missing.
    assert!(is_catch_up_required(
        &make_status(&full.manager, true),
        &sparse.manager
    ));
    assert!(!is_catch_up_required(
        &make_status(&sparse.manager, true),
        &full.manager
    ));

    // The response hands over exactly the missing vote.
    let producer =
        handle_catch_up_request(&full.manager, &make_status(&sparse.manager, false)).unwrap();
    let (blocks, terminal) = drain(producer);
    assert!(blocks.is_empty());
    assert_eq!(terminal.quorum_messages.len(), 1);
    assert_eq!(terminal.quorum_messages[0].finalizer, 1);
}

#[test]
fn catch_up_crosses_an_epoch_transition() {
    let setup = TestSetup::with_parameters(
        4,
        GenesisParameters {
            timestamp: 0,
            epoch_duration_ms: 1_000,
            ..TestSetup::new(1).genesis.parameters
        },
    );
    let mut responder = setup.node(None);
    let root = responder.manager.block_store().tree().last_finalized().clone();

    let b1 = setup.make_block(BlockParams::child_of(&root, 1, 1_500));
    assert_eq!(responder.manager.receive_block(b1.clone()), UpdateResult::Success);
    let b1_pointer = responder
        .manager
        .block_store()
        .tree()
        .get_alive(&b1.hash())
        .unwrap();
    let b2 = setup.make_block(BlockParams::child_of(&b1_pointer, 2, 1_600));
    assert_eq!(responder.manager.receive_block(b2.clone()), UpdateResult::Success);
    let b2_pointer = responder
        .manager
        .block_store()
        .tree()
        .get_alive(&b2.hash())
        .unwrap();
    let entry = FinalizationEntry::new(
        setup.make_qc(b1.hash(), 1, 0),
        setup.make_qc(b2.hash(), 2, 0),
    );
    let b3 = setup.make_block(BlockParams {
        epoch: 1,
        entries: &[&entry],
        ..BlockParams::child_of(&b2_pointer, 3, 1_700)
    });
    assert_eq!(responder.manager.receive_block(b3.clone()), UpdateResult::Success);
    assert_eq!(responder.manager.current_epoch(), 1);

    // A peer that stopped at b1 streams the rest, including the epoch
    // transition block, and ends up aligned.
    let mut peer = setup.node(None);
    assert_eq!(peer.manager.receive_block(b1), UpdateResult::Success);

    let producer =
        handle_catch_up_request(&responder.manager, &make_status(&peer.manager, false)).unwrap();
    let (blocks, terminal) = drain(producer);
    let streamed: Vec<BlockHash> = blocks.iter().map(|b| b.hash()).collect();
    assert_eq!(streamed, vec![b2.hash(), b3.hash()]);
    assert_eq!(terminal.quorum_certs.len(), 1);
    assert_eq!(terminal.quorum_certs[0].block(), b2.hash());

    for block in blocks {
        assert_eq!(peer.manager.receive_block(block), UpdateResult::Success);
    }
    assert_eq!(
        process_catch_up_terminal_data(&mut peer.manager, &terminal),
        TerminalDataResult::Success { progress: false }
    );
    assert_eq!(peer.manager.current_epoch(), 1);
    assert_eq!(peer.manager.current_round(), 3);
    assert!(!is_catch_up_required(
        &make_status(&responder.manager, false),
        &peer.manager
    ));
}
