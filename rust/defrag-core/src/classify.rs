//! Per-node classification.
//!
//! Each worker-node ad is screened, probed, and then placed in exactly one
//! of three buckets (or skipped):
//!
//! * **ready-to-fill**: enough killable CPUs for a multicore job already;
//! * **already-draining**: restricted to preemptable jobs, still short;
//! * **drainable**: a candidate for a new drain, carrying a rank.
//!
//! The reachability probe and the running-job fetch are I/O-bound and
//! independent between machines, so they fan out over a small fixed worker
//! pool. Bucketing itself runs afterwards, in the collector's listing
//! order, which keeps rank ties deterministic.

use crossbeam_channel::unbounded;
use tracing::{debug, info, warn};

use crate::error::QueryError;
use crate::facade::Context;
use crate::machine::{Machine, PreemptableSet, StartdAd};

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// Why a node was passed over this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Not a healthy, startable, partitionable slot exposing the
    /// preemptable-only knob.
    NotEligible,
    /// Did not answer the reachability probe.
    Unreachable,
    /// About to hibernate and genuinely idle.
    Hibernating,
    /// Already being emptied the fast way.
    FastDraining,
    /// Already being refilled with preemptable jobs ahead of a restart.
    BeingEmptied,
    /// The running-job query failed; try again next cycle.
    JobQueryFailed,
    /// No jobs reported on the machine.
    NoRunningJobs,
}

/// A drain candidate with its priority.
#[derive(Debug, Clone)]
pub struct Ranked {
    pub machine: Machine,
    /// Wasted-CPUs over CPUs-still-to-wait-for; higher drains first.
    pub rank: f64,
}

/// The classifier's decision for one node.
#[derive(Debug, Clone)]
pub enum Verdict {
    Skipped(SkipReason),
    Drainable(Ranked),
    Draining(Machine),
    ReadyToFill(Machine),
}

/// Classified fleet, one bucket membership per machine.
#[derive(Debug, Default)]
pub struct Buckets {
    pub ready_to_fill: Vec<Machine>,
    pub draining: Vec<Machine>,
    pub drainable: Vec<Ranked>,
}

impl Buckets {
    fn push(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Skipped(_) => {}
            Verdict::Drainable(ranked) => self.drainable.push(ranked),
            Verdict::Draining(machine) => self.draining.push(machine),
            Verdict::ReadyToFill(machine) => self.ready_to_fill.push(machine),
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

pub fn classify(ctx: &Context<'_>, startds: &[StartdAd], preemptable: &PreemptableSet) -> Buckets {
    // Screening needs nothing but the ad itself; do it before spending any
    // network round-trips on the machine.
    let mut candidates: Vec<&StartdAd> = Vec::new();
    for ad in startds {
        match screen(ad) {
            None => candidates.push(ad),
            Some(SkipReason::NotEligible) => {}
            Some(SkipReason::Hibernating) => {
                info!("skipping {}: about to hibernate", ad.machine);
            }
            Some(SkipReason::FastDraining) => {
                info!("skipping {}: being fast drained", ad.machine);
            }
            Some(SkipReason::BeingEmptied) => {
                info!("skipping {}: being efficiently emptied", ad.machine);
            }
            Some(_) => {}
        }
    }

    let outcomes = fan_out(*ctx, &candidates);

    let mut buckets = Buckets::default();
    for (ad, outcome) in candidates.iter().copied().zip(outcomes) {
        let verdict = bucket(ad, outcome, preemptable, ctx.tunables.target_cpus);
        buckets.push(verdict);
    }
    buckets
}

/// Ad-only part of the cascade. `None` means "worth probing".
fn screen(ad: &StartdAd) -> Option<SkipReason> {
    let eligible = ad.partitionable
        && ad.preemptable_only.is_some()
        && ad.healthy == Some(true)
        && ad.start_jobs;
    if !eligible {
        return Some(SkipReason::NotEligible);
    }
    // The partitionable slot advertises ShouldHibernate even while child
    // slots are busy; only trust it when every CPU is free.
    if ad.should_hibernate && ad.free_cpus == ad.total_cpus {
        return Some(SkipReason::Hibernating);
    }
    if ad.kill_signal {
        return Some(SkipReason::FastDraining);
    }
    if ad.efficient_drain {
        return Some(SkipReason::BeingEmptied);
    }
    None
}

/// Network result for one screened candidate.
#[derive(Debug)]
enum ProbeOutcome {
    Unreachable,
    JobsFailed(QueryError),
    Jobs(Vec<crate::machine::Job>),
}

fn probe_one(ctx: Context<'_>, ad: &StartdAd) -> ProbeOutcome {
    if !ctx.probe.reachable(&ad.machine) {
        return ProbeOutcome::Unreachable;
    }
    match ctx.pool.running_jobs(&ad.machine) {
        Ok(jobs) => ProbeOutcome::Jobs(jobs),
        Err(err) => ProbeOutcome::JobsFailed(err),
    }
}

/// Run [`probe_one`] for every candidate over a bounded worker pool,
/// returning outcomes in candidate order.
fn fan_out(ctx: Context<'_>, candidates: &[&StartdAd]) -> Vec<ProbeOutcome> {
    let workers = ctx.tunables.fan_out.min(candidates.len());
    if workers <= 1 {
        return candidates
            .iter()
            .copied()
            .map(|ad| probe_one(ctx, ad))
            .collect();
    }

    let (task_tx, task_rx) = unbounded();
    let (done_tx, done_rx) = unbounded();
    for task in candidates.iter().copied().enumerate() {
        // Receivers outlive every send; an error here is unreachable.
        let _ = task_tx.send(task);
    }
    drop(task_tx);

    let mut outcomes: Vec<Option<ProbeOutcome>> =
        (0..candidates.len()).map(|_| None).collect();
    std::thread::scope(|scope| {
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let done_tx = done_tx.clone();
            scope.spawn(move || {
                while let Ok((idx, ad)) = task_rx.recv() {
                    let outcome = probe_one(ctx, ad);
                    if done_tx.send((idx, outcome)).is_err() {
                        return;
                    }
                }
            });
        }
        drop(done_tx);
        while let Ok((idx, outcome)) = done_rx.recv() {
            outcomes[idx] = Some(outcome);
        }
    });

    outcomes
        .into_iter()
        .map(|o| o.unwrap_or(ProbeOutcome::Unreachable))
        .collect()
}

/// Decide the bucket for one probed candidate.
fn bucket(
    ad: &StartdAd,
    outcome: ProbeOutcome,
    preemptable: &PreemptableSet,
    target_cpus: u32,
) -> Verdict {
    let jobs = match outcome {
        ProbeOutcome::Unreachable => {
            warn!("{} is not contactable, skipping", ad.machine);
            return Verdict::Skipped(SkipReason::Unreachable);
        }
        ProbeOutcome::JobsFailed(err) => {
            warn!("could not read jobs on {}, skipping: {err}", ad.machine);
            return Verdict::Skipped(SkipReason::JobQueryFailed);
        }
        ProbeOutcome::Jobs(jobs) if jobs.is_empty() => {
            info!("no jobs found on {}, skipping", ad.machine);
            return Verdict::Skipped(SkipReason::NoRunningJobs);
        }
        ProbeOutcome::Jobs(jobs) => jobs,
    };

    let mut machine = Machine::new(ad.machine.clone(), ad.total_cpus, ad.free_cpus);
    for job in jobs {
        if preemptable.contains(&job.global_id) {
            debug!("identified {} as preemptable", job.global_id);
            machine.note_preemptable(job);
        } else {
            debug!("identified {} as unpreemptable", job.global_id);
        }
    }

    let killable = machine.total_killable_cpus();
    debug!(
        "machine {}: total={} free={} preemptable={} killable={}",
        machine.name, machine.total_cpus, machine.num_free, machine.num_preemptable, killable
    );

    if killable >= target_cpus {
        Verdict::ReadyToFill(machine)
    } else if ad.preemptable_only == Some(true) {
        Verdict::Draining(machine)
    } else {
        // Denominator is strictly positive here: killable < target.
        let rank = f64::from(machine.total_cpus - killable) / f64::from(target_cpus - killable);
        Verdict::Drainable(Ranked { machine, rank })
    }
}
