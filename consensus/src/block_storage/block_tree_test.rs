// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    block_storage::{BlockPointer, BlockStatus, BlockTree},
    test_utils::{BlockParams, MockStateComputer, TestSetup},
};
use kestrel_consensus_types::{block::SignedBlock, common::Timestamp};
use std::sync::Arc;

fn genesis_root(setup: &TestSetup) -> Arc<BlockPointer> {
    BlockPointer::genesis(
        setup.genesis_hash,
        setup.genesis.parameters.timestamp,
        setup.genesis.initial_state_hash(),
    )
}

fn make_alive(
    tree: &mut BlockTree,
    setup: &TestSetup,
    parent: &Arc<BlockPointer>,
    round: u64,
    timestamp: Timestamp,
) -> Arc<BlockPointer> {
    let block = setup.make_block(BlockParams::child_of(parent, round, timestamp));
    let executed = MockStateComputer::compute(&parent.state_hash(), round, timestamp, &[]);
    tree.make_live(block, parent, executed.state_hash, timestamp)
}

fn pending_block(
    setup: &TestSetup,
    parent: &Arc<BlockPointer>,
    round: u64,
    timestamp: Timestamp,
) -> Arc<SignedBlock> {
    setup.make_block(BlockParams::child_of(parent, round, timestamp))
}

#[test]
fn statuses_transition_pending_alive_dead() {
    let setup = TestSetup::new(4);
    let root = genesis_root(&setup);
    let mut tree = BlockTree::new(root.clone(), 8, 8);

    let block = pending_block(&setup, &root, 1, 100);
    let hash = block.hash();
    assert!(matches!(tree.block_status(&hash), BlockStatus::Unknown));

    tree.add_pending_block(block.clone());
    assert!(matches!(tree.block_status(&hash), BlockStatus::Pending(_)));

    let children = tree.take_pending_children(&root.hash());
    assert_eq!(children.len(), 1);
    let pointer = tree.make_live(children[0].clone(), &root, block.state_hash(), 100);
    assert!(matches!(tree.block_status(&hash), BlockStatus::Alive(_)));
    assert_eq!(pointer.height(), 1);

    tree.mark_dead(&hash);
    assert!(matches!(tree.block_status(&hash), BlockStatus::Dead));
    assert!(tree.get_alive(&hash).is_none());
}

#[test]
fn pending_children_are_taken_atomically() {
    let setup = TestSetup::new(4);
    let root = genesis_root(&setup);
    let mut tree = BlockTree::new(root.clone(), 8, 8);

    let first = pending_block(&setup, &root, 1, 100);
    let second = pending_block(&setup, &root, 2, 200);
    tree.add_pending_block(first.clone());
    tree.add_pending_block(second.clone());

    let children = tree.take_pending_children(&root.hash());
    assert_eq!(children.len(), 2);
    // Prepend order: latest insertion first.
    assert_eq!(children[0].hash(), second.hash());
    assert!(tree.take_pending_children(&root.hash()).is_empty());
    assert!(matches!(
        tree.block_status(&first.hash()),
        BlockStatus::Unknown
    ));
}

#[test]
fn pending_queue_skips_stale_entries() {
    let setup = TestSetup::new(4);
    let root = genesis_root(&setup);
    let mut tree = BlockTree::new(root.clone(), 8, 8);

    let early = pending_block(&setup, &root, 1, 100);
    let later = pending_block(&setup, &root, 3, 300);
    tree.add_pending_block(early.clone());
    tree.add_pending_block(later.clone());

    // Consuming the children leaves the queue entries stale.
    let _ = tree.take_pending_children(&root.hash());
    assert!(tree.take_next_pending_until(10).is_none());

    // A re-added block is found again through a fresh witness.
    tree.add_pending_block(later.clone());
    let taken = tree.take_next_pending_until(10).expect("witnessed block");
    assert_eq!(taken.hash(), later.hash());
}

#[test]
fn pending_queue_respects_round_bound() {
    let setup = TestSetup::new(4);
    let root = genesis_root(&setup);
    let mut tree = BlockTree::new(root.clone(), 8, 8);

    let late = pending_block(&setup, &root, 7, 700);
    tree.add_pending_block(late.clone());
    assert!(tree.take_next_pending_until(6).is_none());
    assert!(tree.take_next_pending_until(7).is_some());
}

#[test]
fn dead_cache_is_bounded_fifo() {
    let setup = TestSetup::new(4);
    let root = genesis_root(&setup);
    let mut tree = BlockTree::new(root, 3, 8);

    let hashes: Vec<_> = (0..4)
        .map(|i| kestrel_crypto::HashValue::sha256(&[i as u8]))
        .collect();
    for hash in &hashes {
        tree.mark_dead(hash);
    }
    // Oldest entry fell out; the rest remain, in insertion order.
    assert!(!tree.is_dead(&hashes[0]));
    assert!(tree.is_dead(&hashes[1]));
    assert!(tree.is_dead(&hashes[3]));
}

#[test]
fn finalize_chain_prunes_competitors_and_refocuses() {
    let setup = TestSetup::new(4);
    let root = genesis_root(&setup);
    let mut tree = BlockTree::new(root.clone(), 8, 8);

    let b1 = make_alive(&mut tree, &setup, &root, 1, 100);
    let b2 = make_alive(&mut tree, &setup, &b1, 2, 200);
    // Competitor of b1 at the same height.
    let c1 = make_alive(&mut tree, &setup, &root, 2, 150);
    tree.set_focus(c1.clone());

    // A pending block behind the new finalized round must be drained.
    let overtaken = pending_block(&setup, &root, 1, 120);
    tree.add_pending_block(overtaken.clone());

    let pruned = tree.finalize_chain(&[b1.clone()]);
    assert!(pruned.contains(&c1.hash()));
    assert!(pruned.contains(&overtaken.hash()));
    assert!(matches!(tree.block_status(&c1.hash()), BlockStatus::Dead));
    assert!(matches!(
        tree.block_status(&b1.hash()),
        BlockStatus::Finalized(_)
    ));
    assert!(matches!(tree.block_status(&b2.hash()), BlockStatus::Alive(_)));
    assert_eq!(tree.last_finalized().hash(), b1.hash());
    // Focus was on the pruned branch and snaps back to the tip.
    assert_eq!(tree.focus_block().hash(), b1.hash());
}

#[test]
fn leaves_and_branches_partition_alive_blocks() {
    let setup = TestSetup::new(4);
    let root = genesis_root(&setup);
    let mut tree = BlockTree::new(root.clone(), 8, 8);

    let b1 = make_alive(&mut tree, &setup, &root, 1, 100);
    let b2 = make_alive(&mut tree, &setup, &b1, 2, 200);
    let c2 = make_alive(&mut tree, &setup, &b1, 3, 250);

    let leaves: Vec<_> = tree.leaves().iter().map(|p| p.hash()).collect();
    assert!(leaves.contains(&b2.hash()));
    assert!(leaves.contains(&c2.hash()));
    assert!(!leaves.contains(&b1.hash()));

    let branches: Vec<_> = tree.internal_branches().iter().map(|p| p.hash()).collect();
    assert_eq!(branches, vec![b1.hash()]);
}

#[test]
fn descends_from_walks_parent_links() {
    let setup = TestSetup::new(4);
    let root = genesis_root(&setup);
    let mut tree = BlockTree::new(root.clone(), 8, 8);

    let b1 = make_alive(&mut tree, &setup, &root, 1, 100);
    let b2 = make_alive(&mut tree, &setup, &b1, 2, 200);
    let c1 = make_alive(&mut tree, &setup, &root, 2, 150);

    assert!(tree.descends_from(&b2.hash(), &b1));
    assert!(tree.descends_from(&b2.hash(), &root));
    assert!(tree.descends_from(&b1.hash(), &b1));
    assert!(!tree.descends_from(&c1.hash(), &b1));
}
