// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic primitives consumed by the consensus engine.
//!
//! Everything in this crate is pure and deterministic: signing and hashing
//! never touch engine state, and verification reports failure as an error
//! value that callers translate into a rejection reason.

#![deny(unsafe_code)]

pub mod bls;
pub mod ed25519;
pub mod hash;
pub mod vrf;

pub use hash::HashValue;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("wrong length: expected {expected} bytes, got {got}")]
    WrongLength { expected: usize, got: usize },
    #[error("malformed point encoding")]
    MalformedEncoding,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("VRF proof verification failed")]
    InvalidProof,
}

pub type CryptoResult<T> = Result<T, CryptoError>;
