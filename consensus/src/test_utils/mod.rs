// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Deterministic fixtures for consensus tests: a committee of real
//! signers, block and vote builders that produce protocol-valid
//! artifacts, and mock implementations of the capability traits.

use crate::{
    block_storage::BlockPointer,
    config::ConsensusConfig,
    evidence::{Misbehaviour, MisbehaviourHandler},
    liveness::leader_election,
    network::{BroadcastSender, ConsensusMsg},
    persistent_storage::PersistentStorage,
    round_manager::{ConsensusContext, RoundManager},
    state_replication::{ExecutedState, ExecutionError, PayloadProvider, StateComputer},
    timer::TimeService,
};
use kestrel_consensus_types::{
    block::{BlockData, SignedBlock},
    committee::{FinalizationCommittee, SignatureThreshold},
    common::{BlockHash, Epoch, Ratio, Round, StateHash, Timestamp, Transaction},
    finalization_entry::FinalizationEntry,
    finalizer_set::FinalizerSet,
    genesis::{GenesisConfiguration, GenesisParameters},
    quorum_cert::QuorumCert,
    quorum_message::QuorumMessage,
    signer::ConsensusSigner,
    timeout_cert::TimeoutCert,
    timeout_message::TimeoutMessage,
};
use kestrel_crypto::{bls::SignatureAggregator, HashValue};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tempfile::TempDir;

/// A fixed committee of freshly generated signers with equal weight.
pub struct TestSetup {
    pub genesis: GenesisConfiguration,
    pub genesis_hash: BlockHash,
    pub signers: Vec<ConsensusSigner>,
}

impl TestSetup {
    pub fn new(committee_size: usize) -> Self {
        Self::with_parameters(
            committee_size,
            GenesisParameters {
                timestamp: 0,
                epoch_duration_ms: u64::MAX / 4,
                signature_threshold: SignatureThreshold::TWO_THIRDS,
                base_timeout_ms: 10_000,
                timeout_increase: Ratio::new(3, 2),
            },
        )
    }

    pub fn with_parameters(committee_size: usize, parameters: GenesisParameters) -> Self {
        let signers: Vec<ConsensusSigner> = (0..committee_size)
            .map(|i| ConsensusSigner::random(i as u64))
            .collect();
        // Full lottery power on every seat keeps proposer choice (and
        // with it every test) deterministic.
        let members = signers
            .iter()
            .enumerate()
            .map(|(i, signer)| signer.finalizer_info(i as u32, 1, Ratio::new(1, 1)))
            .collect();
        let genesis = GenesisConfiguration {
            parameters,
            committee: FinalizationCommittee::new(members),
        };
        let genesis_hash = genesis.hash();
        Self {
            genesis,
            genesis_hash,
            signers,
        }
    }

    pub fn committee(&self) -> &FinalizationCommittee {
        &self.genesis.committee
    }

    pub fn threshold(&self) -> SignatureThreshold {
        self.genesis.parameters.signature_threshold
    }

    /// The leadership nonce of `epoch`, derived through the given
    /// finalization entries (one per epoch from 1 upward, in order).
    pub fn epoch_nonce(&self, epoch: Epoch, entries: &[&FinalizationEntry]) -> HashValue {
        assert_eq!(entries.len() as Epoch, epoch);
        let mut nonce = self.genesis.initial_leadership_nonce();
        for (offset, entry) in entries.iter().enumerate() {
            let e = offset as Epoch + 1;
            nonce = HashValue::sha256_of(&[
                b"KESTREL_LE_NONCE",
                nonce.as_slice(),
                &e.to_be_bytes(),
                entry.finalized_block().as_slice(),
            ]);
        }
        nonce
    }

    /// A certificate for `block` signed by every committee member.
    pub fn make_qc(&self, block: BlockHash, round: Round, epoch: Epoch) -> QuorumCert {
        self.make_qc_signed_by(block, round, epoch, 0..self.signers.len() as u32)
    }

    pub fn make_qc_signed_by<I: IntoIterator<Item = u32>>(
        &self,
        block: BlockHash,
        round: Round,
        epoch: Epoch,
        indices: I,
    ) -> QuorumCert {
        let mut aggregator = SignatureAggregator::new();
        let mut signatories = FinalizerSet::empty();
        for index in indices {
            let message = self.quorum_message(index, block, round, epoch);
            aggregator.add(&message.signature);
            signatories.insert(index);
        }
        QuorumCert::new(block, round, epoch, aggregator.finish(), signatories)
    }

    pub fn quorum_message(
        &self,
        finalizer: u32,
        block: BlockHash,
        round: Round,
        epoch: Epoch,
    ) -> QuorumMessage {
        let signer = &self.signers[finalizer as usize];
        QuorumMessage::create(&self.genesis_hash, finalizer, block, round, epoch, |bytes| {
            signer.sign_with_aggregation_key(bytes)
        })
    }

    pub fn timeout_message(
        &self,
        finalizer: u32,
        round: Round,
        epoch: Epoch,
        quorum_cert: QuorumCert,
    ) -> TimeoutMessage {
        let signer = &self.signers[finalizer as usize];
        TimeoutMessage::create(
            &self.genesis_hash,
            finalizer,
            round,
            epoch,
            quorum_cert,
            |bytes| signer.sign_with_aggregation_key(bytes),
            signer.block_key(),
        )
    }

    /// A protocol-valid block: proposed round-robin by a full-power seat
    /// (so its lottery proof always wins), certificate signed by the
    /// whole committee, claims computed with the mock executor.
    pub fn make_block(&self, params: BlockParams<'_>) -> Arc<SignedBlock> {
        let nonce = self.epoch_nonce(params.epoch, params.entries);
        let leader = &self.signers[(params.round as usize) % self.signers.len()];
        let qc = self.make_qc(params.parent.hash(), params.parent.round(), params.parent.epoch());
        let transactions = params.transactions.clone();
        let executed = MockStateComputer::compute(
            &params.parent.state_hash(),
            params.round,
            params.timestamp,
            &transactions,
        );
        let entry = if params.epoch > params.parent.epoch() {
            params.entries.last().copied().cloned()
        } else {
            None
        };
        let data = BlockData {
            round: params.round,
            epoch: params.epoch,
            timestamp: params.timestamp,
            baker_id: leader.baker_id(),
            parent: params.parent.hash(),
            quorum_cert: qc,
            timeout_cert: params.timeout_cert.clone(),
            epoch_finalization_entry: entry,
            block_nonce: leader.prove_vrf(&leader_election::election_message(&nonce, params.round)),
            transactions,
            state_hash: executed.state_hash,
            outcomes_hash: executed.outcomes_hash,
        };
        Arc::new(SignedBlock::sign(data, leader.block_key()))
    }
}

/// Inputs for [`TestSetup::make_block`].
pub struct BlockParams<'a> {
    pub round: Round,
    pub epoch: Epoch,
    pub parent: &'a BlockPointer,
    pub timestamp: Timestamp,
    pub timeout_cert: Option<TimeoutCert>,
    /// Finalization entries from epoch 1 upward, newest last; the last
    /// one rides in the block when it opens a new epoch.
    pub entries: &'a [&'a FinalizationEntry],
    pub transactions: Vec<Transaction>,
}

impl<'a> BlockParams<'a> {
    pub fn child_of(parent: &'a BlockPointer, round: Round, timestamp: Timestamp) -> Self {
        Self {
            round,
            epoch: parent.epoch(),
            parent,
            timestamp,
            timeout_cert: None,
            entries: &[],
            transactions: Vec::new(),
        }
    }
}

/// Deterministic execution: the state hash is a digest of everything the
/// block feeds it.
pub struct MockStateComputer;

impl MockStateComputer {
    pub fn compute(
        parent_state: &StateHash,
        round: Round,
        timestamp: Timestamp,
        transactions: &[Transaction],
    ) -> ExecutedState {
        let mut chunks: Vec<Vec<u8>> = vec![
            b"TEST_STATE".to_vec(),
            parent_state.to_vec(),
            round.to_be_bytes().to_vec(),
            timestamp.to_be_bytes().to_vec(),
        ];
        for transaction in transactions {
            chunks.push(transaction.hash().to_vec());
        }
        let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
        let state_hash = HashValue::sha256_of(&refs);
        let outcomes_hash = HashValue::sha256_of(&[b"TEST_OUTCOMES", state_hash.as_slice()]);
        ExecutedState {
            state_hash,
            outcomes_hash,
        }
    }
}

impl StateComputer for MockStateComputer {
    fn execute(
        &self,
        parent_state: &StateHash,
        round: Round,
        timestamp: Timestamp,
        transactions: &[Transaction],
    ) -> Result<ExecutedState, ExecutionError> {
        Ok(Self::compute(parent_state, round, timestamp, transactions))
    }
}

/// Payload provider with a configurable transaction list.
#[derive(Default)]
pub struct MockPayloadProvider {
    pub transactions: Mutex<Vec<Transaction>>,
    pub focus_changes: Mutex<Vec<BlockHash>>,
}

impl PayloadProvider for MockPayloadProvider {
    fn get_payload(&self, _parent: &BlockHash) -> Vec<Transaction> {
        self.transactions.lock().expect("not poisoned").clone()
    }

    fn focus_changed(&self, new_focus: &BlockHash) {
        self.focus_changes
            .lock()
            .expect("not poisoned")
            .push(*new_focus);
    }
}

/// Records everything broadcast.
#[derive(Default)]
pub struct RecordingNetwork {
    pub messages: Mutex<Vec<ConsensusMsg>>,
}

impl RecordingNetwork {
    pub fn take(&self) -> Vec<ConsensusMsg> {
        std::mem::take(&mut *self.messages.lock().expect("not poisoned"))
    }
}

impl BroadcastSender for RecordingNetwork {
    fn broadcast(&self, message: ConsensusMsg) {
        self.messages.lock().expect("not poisoned").push(message);
    }
}

/// A hand-cranked clock recording timer schedules.
pub struct ManualTime {
    pub now_ms: AtomicU64,
    pub schedules: Mutex<Vec<(Round, Duration)>>,
}

impl ManualTime {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
            schedules: Mutex::new(Vec::new()),
        }
    }

    pub fn last_schedule(&self) -> Option<(Round, Duration)> {
        self.schedules.lock().expect("not poisoned").last().copied()
    }
}

impl TimeService for ManualTime {
    fn now(&self) -> Timestamp {
        self.now_ms.load(Ordering::Relaxed)
    }

    fn schedule_round_timeout(&self, round: Round, duration: Duration) {
        self.schedules
            .lock()
            .expect("not poisoned")
            .push((round, duration));
    }
}

/// Collects flagged evidence.
#[derive(Default)]
pub struct RecordingMisbehaviour {
    pub flagged: Mutex<Vec<Misbehaviour>>,
}

impl MisbehaviourHandler for RecordingMisbehaviour {
    fn flag(&self, misbehaviour: Misbehaviour) {
        self.flagged
            .lock()
            .expect("not poisoned")
            .push(misbehaviour);
    }
}

/// A round manager wired to mocks over a temporary database.
pub struct TestNode {
    pub manager: RoundManager,
    pub network: Arc<RecordingNetwork>,
    pub time: Arc<ManualTime>,
    pub payload: Arc<MockPayloadProvider>,
    pub misbehaviour: Arc<RecordingMisbehaviour>,
    pub storage: Arc<PersistentStorage>,
    pub dir: TempDir,
}

impl TestSetup {
    /// Opens a node; `signer` selects which committee member it bakes as,
    /// `None` for an observer.
    pub fn node(&self, signer: Option<usize>) -> TestNode {
        let dir = tempfile::tempdir().expect("tempdir");
        self.node_in(dir, signer)
    }

    /// Opens a node over an existing directory, for restart tests.
    pub fn node_in(&self, dir: TempDir, signer: Option<usize>) -> TestNode {
        let network = Arc::new(RecordingNetwork::default());
        let time = Arc::new(ManualTime::new(1_000_000));
        let payload = Arc::new(MockPayloadProvider::default());
        let misbehaviour = Arc::new(RecordingMisbehaviour::default());
        let storage = Arc::new(PersistentStorage::open(dir.path()).expect("storage opens"));
        let context = ConsensusContext {
            execution: Arc::new(MockStateComputer),
            payload: payload.clone(),
            network: network.clone(),
            time: time.clone(),
            misbehaviour: misbehaviour.clone(),
        };
        let manager = RoundManager::open(
            ConsensusConfig::default(),
            self.genesis.clone(),
            storage.clone(),
            context,
            signer.map(|i| self.signers[i].clone()),
        )
        .expect("engine opens");
        TestNode {
            manager,
            network,
            time,
            payload,
            misbehaviour,
            storage,
            dir,
        }
    }
}
