// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use kestrel_crypto::HashValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A monotonically numbered attempt to certify one block. Advances on
/// either a quorum certificate or a timeout certificate.
pub type Round = u64;

/// A longer-lived committee term spanning many rounds.
pub type Epoch = u64;

/// Chain height of a block (genesis is height 0).
pub type Height = u64;

/// A seat in the finalization committee for one epoch.
pub type FinalizerIndex = u32;

/// A persistent participant identity, stable across epochs.
pub type BakerId = u64;

/// Milliseconds since the unix epoch.
pub type Timestamp = u64;

/// Hash identifying a block.
pub type BlockHash = HashValue;

/// Hash of the state resulting from executing a block.
pub type StateHash = HashValue;

/// Hash over the per-transaction outcomes of a block.
pub type OutcomesHash = HashValue;

/// A non-negative rational, used for the timeout growth factor and the
/// signature threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratio {
    pub numerator: u64,
    pub denominator: u64,
}

impl Ratio {
    pub const fn new(numerator: u64, denominator: u64) -> Self {
        assert!(denominator != 0);
        Self {
            numerator,
            denominator,
        }
    }

    /// `value * self`, saturating at `u64::MAX`.
    pub fn apply(&self, value: u64) -> u64 {
        let scaled = (value as u128) * (self.numerator as u128) / (self.denominator as u128);
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// An opaque transaction carried in a block. Execution is the business of
/// the state computer; consensus only moves the bytes and hashes them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

impl Transaction {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn hash(&self) -> HashValue {
        HashValue::sha256_of(&[b"KESTREL_TRANSACTION", &self.payload])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_apply_scales() {
        let growth = Ratio::new(3, 2);
        assert_eq!(growth.apply(10_000), 15_000);
        assert_eq!(growth.apply(1), 1);
    }

    #[test]
    fn ratio_apply_saturates() {
        let growth = Ratio::new(2, 1);
        assert_eq!(growth.apply(u64::MAX), u64::MAX);
    }
}
