// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    common::{BlockHash, Epoch, FinalizerIndex, Round},
    quorum_cert::QuorumCert,
    timeout_cert::TimeoutSignatureMessage,
};
use kestrel_crypto::{
    bls::{BlsPublicKey, BlsSignature},
    ed25519::{Ed25519PrivateKey, Ed25519PublicKey, Ed25519Signature},
    CryptoResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The BLS-signed content of a timeout message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutMessageBody {
    pub finalizer: FinalizerIndex,
    /// The round being abandoned.
    pub round: Round,
    /// The epoch the signer is in.
    pub epoch: Epoch,
    /// The signer's highest known quorum certificate.
    pub quorum_cert: QuorumCert,
    /// BLS signature over `(genesis, round, qc round, qc epoch)`; the part
    /// folded into a timeout certificate.
    pub aggregate_part: BlsSignature,
}

impl TimeoutMessageBody {
    fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = b"KESTREL_TIMEOUT_ENVELOPE".to_vec();
        bytes.extend(bcs::to_bytes(self).expect("timeout body serializes"));
        bytes
    }

    pub fn aggregate_signing_bytes(genesis: &BlockHash, round: Round, qc: &QuorumCert) -> Vec<u8> {
        TimeoutSignatureMessage {
            genesis,
            round,
            qc_round: qc.round(),
            qc_epoch: qc.epoch(),
        }
        .signing_bytes()
    }
}

/// A timeout message: a BLS-signed body wrapped in an Ed25519 envelope
/// under the finalizer's block-signing key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutMessage {
    pub body: TimeoutMessageBody,
    pub signature: Ed25519Signature,
}

impl TimeoutMessage {
    /// Builds the doubly-signed message for `round` carrying the signer's
    /// highest `quorum_cert`.
    pub fn create<F>(
        genesis: &BlockHash,
        finalizer: FinalizerIndex,
        round: Round,
        epoch: Epoch,
        quorum_cert: QuorumCert,
        sign_aggregate: F,
        envelope_key: &Ed25519PrivateKey,
    ) -> Self
    where
        F: FnOnce(&[u8]) -> BlsSignature,
    {
        let aggregate_part = sign_aggregate(&TimeoutMessageBody::aggregate_signing_bytes(
            genesis,
            round,
            &quorum_cert,
        ));
        let body = TimeoutMessageBody {
            finalizer,
            round,
            epoch,
            quorum_cert,
            aggregate_part,
        };
        let signature = envelope_key.sign(&body.signing_bytes());
        Self { body, signature }
    }

    pub fn round(&self) -> Round {
        self.body.round
    }

    pub fn epoch(&self) -> Epoch {
        self.body.epoch
    }

    pub fn finalizer(&self) -> FinalizerIndex {
        self.body.finalizer
    }

    pub fn quorum_cert(&self) -> &QuorumCert {
        &self.body.quorum_cert
    }

    /// Ed25519 envelope check.
    pub fn verify_envelope(&self, key: &Ed25519PublicKey) -> CryptoResult<()> {
        key.verify(&self.body.signing_bytes(), &self.signature)
    }

    /// BLS payload check.
    pub fn verify_aggregate_part(
        &self,
        genesis: &BlockHash,
        key: &BlsPublicKey,
    ) -> CryptoResult<()> {
        let bytes = TimeoutMessageBody::aggregate_signing_bytes(
            genesis,
            self.body.round,
            &self.body.quorum_cert,
        );
        self.body.aggregate_part.verify(&bytes, key)
    }
}

impl fmt::Display for TimeoutMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TimeoutMessage(finalizer: {}, round: {}, epoch: {}, qc round: {})",
            self.finalizer(),
            self.round(),
            self.epoch(),
            self.quorum_cert().round()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{common::Ratio, signer::ConsensusSigner};
    use claims::{assert_err, assert_ok};
    use kestrel_crypto::HashValue;

    #[test]
    fn envelope_and_aggregate_part_verify() {
        let genesis = HashValue::sha256(b"genesis");
        let signer = ConsensusSigner::random(0);
        let message = TimeoutMessage::create(
            &genesis,
            0,
            5,
            1,
            QuorumCert::genesis(genesis),
            |bytes| signer.sign_with_aggregation_key(bytes),
            signer.block_key(),
        );
        let info = signer.finalizer_info(0, 1, Ratio::new(1, 1));
        assert_ok!(message.verify_envelope(&info.sign_key));
        assert_ok!(message.verify_aggregate_part(&genesis, &info.aggregation_key));

        let other = ConsensusSigner::random(1).finalizer_info(1, 1, Ratio::new(1, 1));
        assert_err!(message.verify_envelope(&other.sign_key));
        assert_err!(message.verify_aggregate_part(&genesis, &other.aggregation_key));
    }
}
