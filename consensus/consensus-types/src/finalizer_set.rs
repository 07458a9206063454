// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! A compact bitmask over finalizer committee seats, carried in quorum and
//! timeout certificates to name the aggregate's signers.

use crate::common::FinalizerIndex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerSet {
    #[serde(with = "serde_bytes")]
    bits: Vec<u8>,
}

impl FinalizerSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_indices<I: IntoIterator<Item = FinalizerIndex>>(indices: I) -> Self {
        let mut set = Self::empty();
        for index in indices {
            set.insert(index);
        }
        set
    }

    pub fn insert(&mut self, index: FinalizerIndex) {
        let byte = (index / 8) as usize;
        if byte >= self.bits.len() {
            self.bits.resize(byte + 1, 0);
        }
        self.bits[byte] |= 1 << (index % 8);
    }

    pub fn contains(&self, index: FinalizerIndex) -> bool {
        let byte = (index / 8) as usize;
        self.bits
            .get(byte)
            .is_some_and(|b| b & (1 << (index % 8)) != 0)
    }

    pub fn union(&self, other: &FinalizerSet) -> FinalizerSet {
        let mut bits = vec![0u8; self.bits.len().max(other.bits.len())];
        for (i, b) in bits.iter_mut().enumerate() {
            *b = self.bits.get(i).copied().unwrap_or(0) | other.bits.get(i).copied().unwrap_or(0);
        }
        FinalizerSet { bits }
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = FinalizerIndex> + '_ {
        self.bits.iter().enumerate().flat_map(|(byte, bits)| {
            (0..8)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| (byte * 8 + bit) as FinalizerIndex)
        })
    }

    /// True iff every member of `self` is also in `other`.
    pub fn is_subset_of(&self, other: &FinalizerSet) -> bool {
        self.iter().all(|index| other.contains(index))
    }
}

impl fmt::Debug for FinalizerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<FinalizerIndex> for FinalizerSet {
    fn from_iter<I: IntoIterator<Item = FinalizerIndex>>(iter: I) -> Self {
        Self::from_indices(iter)
    }
}
