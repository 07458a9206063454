// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Stake-proportional VRF leader election.
//!
//! Every committee seat holds a lottery power, its stake share. A baker
//! may propose in a round iff its VRF proof over the round's election
//! message verifies under the seat's key and the proof output wins the
//! seat's lottery. Several seats can win one round; competing proposals
//! are arbitrated by which block gathers a quorum certificate. The
//! winning proof doubles as the block nonce and seeds future leadership
//! nonces.

use kestrel_consensus_types::{committee::FinalizerInfo, common::Round};
use kestrel_crypto::{
    vrf::{self, VrfProofValue},
    HashValue,
};

/// The message leadership proofs cover for `round` under `nonce`.
pub fn election_message(nonce: &HashValue, round: Round) -> Vec<u8> {
    let mut message = b"KESTREL_LEADER".to_vec();
    message.extend_from_slice(nonce.as_slice());
    message.extend_from_slice(&round.to_be_bytes());
    message
}

/// Checks `proof` as `seat`'s claim to propose in `round` under `nonce`:
/// the proof must verify against the seat's VRF key and its output must
/// fall below the seat's stake-proportional lottery threshold.
pub fn verify_leadership(
    seat: &FinalizerInfo,
    nonce: &HashValue,
    round: Round,
    proof: &VrfProofValue,
) -> bool {
    let output = match seat.vrf_key.verify(&election_message(nonce, round), proof) {
        Ok(output) => output,
        Err(_) => return false,
    };
    vrf::wins_lottery(
        &output,
        seat.lottery_power.numerator,
        seat.lottery_power.denominator,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_consensus_types::{common::Ratio, signer::ConsensusSigner};

    fn seat(signer: &ConsensusSigner, index: u32, lottery_power: Ratio) -> FinalizerInfo {
        signer.finalizer_info(index, 1, lottery_power)
    }

    #[test]
    fn full_power_seat_wins_every_round() {
        let signer = ConsensusSigner::random(0);
        let seat = seat(&signer, 0, Ratio::new(1, 1));
        let nonce = HashValue::sha256(b"nonce");
        for round in 0..20 {
            let proof = signer.prove_vrf(&election_message(&nonce, round));
            assert!(verify_leadership(&seat, &nonce, round, &proof));
        }
    }

    #[test]
    fn zero_power_seat_never_wins() {
        let signer = ConsensusSigner::random(0);
        let seat = seat(&signer, 0, Ratio::new(0, 1));
        let nonce = HashValue::sha256(b"nonce");
        for round in 0..20 {
            let proof = signer.prove_vrf(&election_message(&nonce, round));
            assert!(!verify_leadership(&seat, &nonce, round, &proof));
        }
    }

    #[test]
    fn proof_binds_to_round_and_key() {
        let signer = ConsensusSigner::random(0);
        let seat_0 = seat(&signer, 0, Ratio::new(1, 1));
        let nonce = HashValue::sha256(b"nonce");
        let proof = signer.prove_vrf(&election_message(&nonce, 3));
        assert!(verify_leadership(&seat_0, &nonce, 3, &proof));
        assert!(!verify_leadership(&seat_0, &nonce, 4, &proof));

        let other = ConsensusSigner::random(1);
        let seat_1 = other.finalizer_info(1, 1, Ratio::new(1, 1));
        assert!(!verify_leadership(&seat_1, &nonce, 3, &proof));
    }
}
