use serde::{Deserialize, Serialize};

/// Snapshot of the reference manager's monotonic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Handles whose body was detached after a successful write-back.
    pub handles_cleared: u64,
    /// Eviction rounds that ran to completion.
    pub rounds_completed: u64,
    /// Pressure notifications dropped because a round was already in flight.
    pub rounds_dropped: u64,
    /// Handles currently eligible for eviction.
    pub clearable: u64,
}

/// Snapshot of the decode-side counters. Advisory, not part of the codec
/// contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecStats {
    pub nodes_decoded: u64,
    pub decode_time_us: u64,
}

impl CodecStats {
    pub fn avg_decode_time_us(&self) -> f64 {
        if self.nodes_decoded == 0 {
            0.0
        } else {
            self.decode_time_us as f64 / self.nodes_decoded as f64
        }
    }
}
