// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Per-epoch consensus state: the finalization committee and the
//! leadership-election nonce, with a one-epoch lookahead used for the
//! cheap pre-checks on pending blocks.

use kestrel_consensus_types::{
    committee::{FinalizationCommittee, SignatureThreshold},
    common::Epoch,
    finalization_entry::FinalizationEntry,
    genesis::GenesisConfiguration,
};
use kestrel_crypto::HashValue;
use std::{collections::BTreeMap, sync::Arc};

/// How many past epochs keep their committees resolvable; timeout
/// certificates may span the current epoch and its predecessor.
const RETAINED_EPOCHS: u64 = 2;

#[derive(Clone, Debug)]
pub struct EpochState {
    pub epoch: Epoch,
    pub committee: Arc<FinalizationCommittee>,
    pub leadership_nonce: HashValue,
}

/// The window of epoch states the engine can answer for.
pub struct EpochCommittees {
    threshold: SignatureThreshold,
    committee: Arc<FinalizationCommittee>,
    states: BTreeMap<Epoch, EpochState>,
}

impl EpochCommittees {
    pub fn new(genesis: &GenesisConfiguration) -> Self {
        let committee = Arc::new(genesis.committee.clone());
        let mut states = BTreeMap::new();
        states.insert(
            0,
            EpochState {
                epoch: 0,
                committee: committee.clone(),
                leadership_nonce: genesis.initial_leadership_nonce(),
            },
        );
        Self {
            threshold: genesis.parameters.signature_threshold,
            committee,
            states,
        }
    }

    pub fn threshold(&self) -> SignatureThreshold {
        self.threshold
    }

    pub fn state_for(&self, epoch: Epoch) -> Option<&EpochState> {
        self.states.get(&epoch)
    }

    /// The committee seated in `epoch`, when that epoch is inside the
    /// retained window.
    ///
    /// Committee rotation is driven by the external staking ledger, which
    /// is not consensus's business; within this engine the genesis
    /// committee persists, and this lookup is the single seam a
    /// stake-driven implementation replaces.
    pub fn committee_for(&self, epoch: Epoch) -> Option<&FinalizationCommittee> {
        self.state_for(epoch).map(|state| state.committee.as_ref())
    }

    /// Shared handle to the committee, for contexts that outlive a borrow
    /// of this window.
    pub fn committee_arc_for(&self, epoch: Epoch) -> Option<Arc<FinalizationCommittee>> {
        self.state_for(epoch).map(|state| state.committee.clone())
    }

    pub fn leadership_nonce(&self, epoch: Epoch) -> Option<HashValue> {
        self.state_for(epoch).map(|state| state.leadership_nonce)
    }

    /// The nonce epoch `epoch + 1` is *expected* to use, before the
    /// finalization entry pinning it exists. Used only for the cheap
    /// pre-checks on blocks received ahead of their epoch.
    pub fn predicted_leadership_nonce(&self, epoch: Epoch) -> Option<HashValue> {
        self.leadership_nonce(epoch).map(|nonce| {
            HashValue::sha256_of(&[
                b"KESTREL_LE_NONCE",
                nonce.as_slice(),
                &(epoch + 1).to_be_bytes(),
            ])
        })
    }

    /// The nonce epoch `new_epoch` gets when `entry` crosses its
    /// boundary, derivable as soon as the entry is known.
    pub fn nonce_for_entry(
        &self,
        new_epoch: Epoch,
        entry: &FinalizationEntry,
    ) -> Option<HashValue> {
        let previous_nonce = self.leadership_nonce(new_epoch.checked_sub(1)?)?;
        Some(HashValue::sha256_of(&[
            b"KESTREL_LE_NONCE",
            previous_nonce.as_slice(),
            &new_epoch.to_be_bytes(),
            entry.finalized_block().as_slice(),
        ]))
    }

    /// Seats epoch `new_epoch`, deriving its nonce from the predecessor's
    /// nonce and the finalization entry that crossed the boundary.
    /// Returns the new nonce so the caller can persist it.
    pub fn advance_epoch(&mut self, new_epoch: Epoch, entry: &FinalizationEntry) -> HashValue {
        let nonce = self
            .nonce_for_entry(new_epoch, entry)
            .unwrap_or_else(HashValue::zero);
        self.restore(new_epoch, nonce);
        nonce
    }

    /// Seats `epoch` with an already-known nonce, used by recovery.
    pub fn restore(&mut self, epoch: Epoch, nonce: HashValue) {
        self.states.insert(
            epoch,
            EpochState {
                epoch,
                committee: self.committee.clone(),
                leadership_nonce: nonce,
            },
        );
        let keep_from = epoch.saturating_sub(RETAINED_EPOCHS);
        self.states.retain(|e, _| *e >= keep_from);
    }
}
