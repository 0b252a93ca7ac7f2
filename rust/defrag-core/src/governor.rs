//! Demand-adaptive concurrency governor.
//!
//! Translates multicore job pressure into a cap on simultaneously-draining
//! nodes. Draining wastes capacity while it runs, so the cap is generous
//! only when idle multicore demand is high and the farm is not already busy
//! running multicore work. An operator-placed inhibit file forces the cap
//! to zero and disables kill bursts for the cycle.

use std::path::Path;

use crate::config::Tunables;
use crate::machine::JobCounts;

/// Cycle-wide drain budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainBudget {
    /// Maximum nodes that may be draining when the cycle ends.
    pub max_draining: usize,
    /// Whether kill bursts may execute this cycle.
    pub drain_allowed: bool,
}

/// `true` when the inhibit file exists. Contents are ignored.
pub fn inhibited(path: &Path) -> bool {
    path.is_file()
}

pub fn drain_budget(counts: JobCounts, inhibit: bool, t: &Tunables) -> DrainBudget {
    if inhibit {
        return DrainBudget {
            max_draining: 0,
            drain_allowed: false,
        };
    }
    let max_draining = if counts.idle > t.idle_high {
        if counts.running > t.running_high {
            t.concurrency_low
        } else {
            t.concurrency_high
        }
    } else {
        t.concurrency_default
    };
    DrainBudget {
        max_draining,
        drain_allowed: true,
    }
}
