//! Core value types shared by every pipeline stage.

pub mod event;
pub mod subnet_key;

pub use event::{AsnRecord, AsnStatus, CacheRow, CacheSource, Event, EventCounts, EventKind, IpStats};
pub use subnet_key::SubnetKey;

use serde::{Deserialize, Serialize};

/// Weights applied when scoring an IP or subnet from its counters.
///
/// Bans dominate, fails contribute, unbans and accepted logins are
/// neutral by default. All weights are tunable through the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub ban: u64,
    pub fail: u64,
    pub unban: u64,
    pub ok: u64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        ScoreWeights {
            ban: 3,
            fail: 1,
            unban: 0,
            ok: 0,
        }
    }
}

impl ScoreWeights {
    pub fn score(&self, counts: &EventCounts) -> u64 {
        counts.ban * self.ban
            + counts.fail * self.fail
            + counts.unban * self.unban
            + counts.ok * self.ok
    }
}
