// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Data types exchanged and certified by the Kestrel consensus protocol:
//! blocks, quorum and timeout certificates, finalization entries, the
//! per-round vote messages they are aggregated from, and the catch-up wire
//! messages.
//!
//! Everything here is immutable once constructed and serializes canonically
//! with BCS; signing bytes are derived from the BCS encoding under a
//! per-message domain prefix.

#![deny(unsafe_code)]

pub mod block;
pub mod catch_up;
pub mod committee;
pub mod common;
pub mod finalization_entry;
pub mod finalizer_set;
pub mod genesis;
pub mod quorum_cert;
pub mod quorum_message;
pub mod signer;
pub mod timeout_cert;
pub mod timeout_message;

use thiserror::Error;

/// Structural or cryptographic failure while validating a certificate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertificateError {
    #[error("certificate signature does not verify")]
    InvalidSignature,
    #[error("signed weight below the finalization threshold")]
    InsufficientWeight,
    #[error("finalizer index {0} is not in the committee")]
    UnknownFinalizer(u32),
    #[error("no committee known for epoch {0}")]
    UnknownEpoch(u64),
    #[error("certificate is structurally malformed: {0}")]
    Malformed(&'static str),
}
