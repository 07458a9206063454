// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    common::{BakerId, BlockHash, Epoch, OutcomesHash, Round, StateHash, Timestamp, Transaction},
    finalization_entry::FinalizationEntry,
    quorum_cert::QuorumCert,
    timeout_cert::TimeoutCert,
};
use kestrel_crypto::{
    ed25519::{Ed25519PrivateKey, Ed25519PublicKey, Ed25519Signature},
    vrf::VrfProofValue,
    CryptoResult, HashValue,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The signed content of a block. The block hash covers exactly these
/// fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub round: Round,
    pub epoch: Epoch,
    pub timestamp: Timestamp,
    pub baker_id: BakerId,
    /// The parent block's hash; the embedded certificate must name it.
    pub parent: BlockHash,
    /// Certificate for the parent block.
    pub quorum_cert: QuorumCert,
    /// Present iff the previous round timed out.
    pub timeout_cert: Option<TimeoutCert>,
    /// Present iff this block transitions to a new epoch.
    pub epoch_finalization_entry: Option<FinalizationEntry>,
    /// VRF output establishing the proposer won the round lottery; also
    /// seeds the next epoch's leadership nonce.
    pub block_nonce: VrfProofValue,
    pub transactions: Vec<Transaction>,
    /// Claimed hash of the state after executing this block.
    pub state_hash: StateHash,
    /// Claimed hash over the transaction outcomes.
    pub outcomes_hash: OutcomesHash,
}

impl BlockData {
    pub fn hash(&self) -> BlockHash {
        let bytes = bcs::to_bytes(self).expect("block data serializes");
        HashValue::sha256_of(&[b"KESTREL_BLOCK", &bytes])
    }
}

/// A block produced and signed by a baker.
///
/// The hash is computed once at construction and again on deserialization;
/// it is never read from the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SignedBlock {
    data: BlockData,
    /// Public key the signature verifies under; must match the baker's
    /// committee record.
    signature_key: Ed25519PublicKey,
    signature: Ed25519Signature,
    #[serde(skip)]
    hash: BlockHash,
}

impl SignedBlock {
    pub fn new(
        data: BlockData,
        signature_key: Ed25519PublicKey,
        signature: Ed25519Signature,
    ) -> Self {
        let hash = data.hash();
        Self {
            data,
            signature_key,
            signature,
            hash,
        }
    }

    /// Signs `data` with `key` and assembles the block.
    pub fn sign(data: BlockData, key: &Ed25519PrivateKey) -> Self {
        let hash = data.hash();
        let signature = key.sign(hash.as_slice());
        Self {
            data,
            signature_key: key.public_key(),
            signature,
            hash,
        }
    }

    pub fn data(&self) -> &BlockData {
        &self.data
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn round(&self) -> Round {
        self.data.round
    }

    pub fn epoch(&self) -> Epoch {
        self.data.epoch
    }

    pub fn timestamp(&self) -> Timestamp {
        self.data.timestamp
    }

    pub fn baker_id(&self) -> BakerId {
        self.data.baker_id
    }

    pub fn parent(&self) -> BlockHash {
        self.data.parent
    }

    pub fn quorum_cert(&self) -> &QuorumCert {
        &self.data.quorum_cert
    }

    pub fn timeout_cert(&self) -> Option<&TimeoutCert> {
        self.data.timeout_cert.as_ref()
    }

    pub fn epoch_finalization_entry(&self) -> Option<&FinalizationEntry> {
        self.data.epoch_finalization_entry.as_ref()
    }

    pub fn block_nonce(&self) -> &VrfProofValue {
        &self.data.block_nonce
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.data.transactions
    }

    pub fn state_hash(&self) -> StateHash {
        self.data.state_hash
    }

    pub fn outcomes_hash(&self) -> OutcomesHash {
        self.data.outcomes_hash
    }

    pub fn signature_key(&self) -> &Ed25519PublicKey {
        &self.signature_key
    }

    /// Checks the baker signature over the block hash against the claimed
    /// key. Whether the claimed key is the baker's registered key is a
    /// separate, committee-level check.
    pub fn verify_signature(&self) -> CryptoResult<()> {
        self.signature_key
            .verify(self.hash.as_slice(), &self.signature)
    }
}

impl<'de> Deserialize<'de> for SignedBlock {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename = "SignedBlock")]
        struct Wire {
            data: BlockData,
            signature_key: Ed25519PublicKey,
            signature: Ed25519Signature,
        }
        let Wire {
            data,
            signature_key,
            signature,
        } = Wire::deserialize(deserializer)?;
        Ok(SignedBlock::new(data, signature_key, signature))
    }
}

impl fmt::Display for SignedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[block {} round: {} epoch: {} baker: {} parent: {}]",
            self.hash.short_str(),
            self.round(),
            self.epoch(),
            self.baker_id(),
            self.parent().short_str(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::ConsensusSigner;
    use claims::{assert_err, assert_ok};

    fn block_data(signer: &ConsensusSigner) -> BlockData {
        let genesis = HashValue::sha256(b"genesis");
        BlockData {
            round: 1,
            epoch: 0,
            timestamp: 1_000,
            baker_id: signer.baker_id(),
            parent: genesis,
            quorum_cert: QuorumCert::genesis(genesis),
            timeout_cert: None,
            epoch_finalization_entry: None,
            block_nonce: signer.prove_vrf(b"nonce"),
            transactions: vec![Transaction::new(b"tx".to_vec())],
            state_hash: HashValue::sha256(b"state"),
            outcomes_hash: HashValue::sha256(b"outcomes"),
        }
    }

    #[test]
    fn sign_and_verify() {
        let signer = ConsensusSigner::random(7);
        let block = SignedBlock::sign(block_data(&signer), signer.block_key());
        assert_ok!(block.verify_signature());
    }

    #[test]
    fn foreign_key_rejects() {
        let signer = ConsensusSigner::random(7);
        let other = ConsensusSigner::random(8);
        let data = block_data(&signer);
        let hash = data.hash();
        let forged = SignedBlock::new(
            data,
            signer.block_key().public_key(),
            other.sign_with_block_key(hash.as_slice()),
        );
        assert_err!(forged.verify_signature());
    }

    #[test]
    fn deserialization_recomputes_hash() {
        let signer = ConsensusSigner::random(7);
        let block = SignedBlock::sign(block_data(&signer), signer.block_key());
        let bytes = bcs::to_bytes(&block).unwrap();
        let restored: SignedBlock = bcs::from_bytes(&bytes).unwrap();
        assert_eq!(block.hash(), restored.hash());
        assert_eq!(block, restored);
        assert_ok!(restored.verify_signature());
    }
}
