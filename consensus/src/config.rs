// Copyright (c) Kestrel Labs
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Node-local tuning knobs for the consensus engine. Chain-level
/// parameters (threshold, timeout base and growth) come from genesis and
/// are identical on every node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsensusConfig {
    /// Reject blocks whose timestamp is further than this many
    /// milliseconds in the future.
    pub early_block_threshold_ms: u64,
    /// Capacity of the dead-block de-duplication cache.
    pub dead_cache_size: usize,
    /// Finalized blocks kept in memory for recent-status queries before
    /// lookups fall through to the block store.
    pub recent_finalized_in_mem: usize,
    /// Bound on buffered blocks in one catch-up response stream.
    pub catch_up_channel_size: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            early_block_threshold_ms: 30_000,
            dead_cache_size: 1_000,
            recent_finalized_in_mem: 1_000,
            catch_up_channel_size: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_serde() {
        let config = ConsensusConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: ConsensusConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(config, back);
    }
}
