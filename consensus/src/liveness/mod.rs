// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

//! Round liveness: the persisted round status, leader election and block
//! production.

pub mod leader_election;
pub mod proposal_generator;
pub mod round_state;
