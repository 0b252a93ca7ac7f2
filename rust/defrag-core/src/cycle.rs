//! One full control cycle: snapshot, govern, classify, act.
//!
//! Cycles are stateless and idempotent given the fleet state; cadence is
//! external. Whatever this cycle could not finish, the next one will see
//! again through the scheduler's own reporting.

use tracing::{debug, info};

use crate::actuate::{actuate, CycleOutcome};
use crate::classify::classify;
use crate::error::FatalError;
use crate::facade::Context;
use crate::governor::{drain_budget, inhibited};
use crate::snapshot::FleetSnapshot;

pub fn run_cycle(ctx: &Context<'_>) -> Result<CycleOutcome, FatalError> {
    info!("starting defragmentation cycle");

    let snapshot = FleetSnapshot::collect(ctx)?;

    let inhibit = inhibited(&ctx.tunables.inhibit_file);
    if inhibit {
        info!(
            "draining inhibited by {}",
            ctx.tunables.inhibit_file.display()
        );
    }
    let budget = drain_budget(snapshot.counts, inhibit, ctx.tunables);
    debug!("max concurrent draining machines = {}", budget.max_draining);

    let buckets = classify(ctx, &snapshot.startds, &snapshot.preemptable);

    info!("machines that can be drained:");
    for candidate in &buckets.drainable {
        info!("  {} {:.2}", candidate.machine.name, candidate.rank);
    }
    info!("machines with enough killable CPUs:");
    for machine in &buckets.ready_to_fill {
        info!("  {}", machine.name);
    }
    info!("machines draining:");
    for machine in &buckets.draining {
        info!("  {}", machine.name);
    }

    let outcome = actuate(ctx, buckets, budget);
    info!(
        "cycle complete: {} drains started, {} cancelled, {} jobs killed, {} draining",
        outcome.drains_started, outcome.drains_cancelled, outcome.jobs_killed, outcome.draining
    );
    Ok(outcome)
}
