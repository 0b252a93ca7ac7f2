//! One-shot fleet collection.
//!
//! Best-effort over the schedds: a schedd that cannot be queried
//! contributes zero counts and no preemptable ids but never aborts the
//! cycle. The collector-level listings are fatal: with no fleet there is
//! nothing safe to do.

use tracing::{debug, warn};

use crate::error::FatalError;
use crate::facade::Context;
use crate::machine::{JobCounts, PreemptableSet, StartdAd};

/// Everything a cycle learns about the pool before deciding anything.
#[derive(Debug, Default)]
pub struct FleetSnapshot {
    /// Multicore job demand, summed across schedds.
    pub counts: JobCounts,
    /// Union of preemptable job ids across schedds.
    pub preemptable: PreemptableSet,
    /// Filtered worker-node ads, in the collector's listing order.
    pub startds: Vec<StartdAd>,
}

impl FleetSnapshot {
    pub fn collect(ctx: &Context<'_>) -> Result<Self, FatalError> {
        let schedds = ctx.pool.schedd_hosts()?;
        if schedds.is_empty() {
            return Err(FatalError::NoSchedds);
        }

        let mut snapshot = FleetSnapshot::default();
        for schedd in &schedds {
            match ctx.pool.multicore_counts(schedd) {
                Ok(counts) => snapshot.counts.merge(counts),
                Err(err) => {
                    warn!("could not read multicore jobs on {schedd}, skipping: {err}");
                }
            }
            match ctx.pool.preemptable_job_ids(schedd) {
                Ok(ids) => snapshot.preemptable.extend(ids),
                Err(err) => {
                    warn!("could not read preemptable jobs on {schedd}, skipping: {err}");
                }
            }
        }
        debug!(
            "idle multicore jobs = {}, running multicore jobs = {}, preemptable jobs = {}",
            snapshot.counts.idle,
            snapshot.counts.running,
            snapshot.preemptable.len()
        );

        snapshot.startds = ctx.pool.startd_ads(&ctx.tunables.startd_constraint)?;
        if snapshot.startds.is_empty() {
            return Err(FatalError::NoStartds);
        }
        debug!("{} startd ads matched the constraint", snapshot.startds.len());

        Ok(snapshot)
    }
}
