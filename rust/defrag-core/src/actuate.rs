//! Applying the cycle's decisions to the fleet.
//!
//! Three phases, in order: finish the machines that already have enough
//! killable CPUs (with a kill burst where needed), cancel drains above the
//! budget, start new drains up to the budget. Per-machine failures are
//! logged and skipped; the classifier will see the node again next cycle.

use tracing::{debug, error, info, warn};

use crate::classify::{Buckets, Ranked};
use crate::facade::{ConfigKey, Context, Daemon};
use crate::governor::DrainBudget;
use crate::machine::Machine;

/// What a cycle actually did, for the terminal log line and for tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub jobs_killed: usize,
    pub drains_started: usize,
    pub drains_cancelled: usize,
    /// Machines draining once the cycle is done.
    pub draining: usize,
    pub max_draining: usize,
}

pub fn actuate(ctx: &Context<'_>, buckets: Buckets, budget: DrainBudget) -> CycleOutcome {
    let mut outcome = CycleOutcome {
        max_draining: budget.max_draining,
        draining: buckets.draining.len(),
        ..CycleOutcome::default()
    };

    outcome.jobs_killed = finish_draining(ctx, buckets.ready_to_fill, budget.drain_allowed);
    outcome.drains_cancelled = cancel_excess(ctx, buckets.draining, &mut outcome.draining, &budget);
    outcome.drains_started = start_drains(ctx, buckets.drainable, &mut outcome.draining, &budget);

    if !ctx.halt.raised() && outcome.draining != budget.max_draining {
        warn!(
            "{} machines draining, should be {}",
            outcome.draining, budget.max_draining
        );
    }
    outcome
}

// ---------------------------------------------------------------------------
// Phase 1: machines with enough killable CPUs
// ---------------------------------------------------------------------------

/// Evict just enough preemptable jobs that the free CPUs reach a multiple
/// of the target, then restore normal job intake. The restore writes run on
/// every path, kill burst or not: they re-assert the state the node must be
/// in to receive the multicore job.
fn finish_draining(ctx: &Context<'_>, machines: Vec<Machine>, drain_allowed: bool) -> usize {
    let mut killed = 0;
    for mut machine in machines {
        if ctx.halt.raised() {
            warn!("stop requested, leaving remaining machines to the next cycle");
            break;
        }
        info!("draining finished on {}", machine.name);
        machine.sort_jobs_newest_first();
        let quota = machine.kill_quota(ctx.tunables.target_cpus);

        if quota > 0 && drain_allowed {
            // Quiesce first: a job landing mid-burst would reclaim the CPUs
            // the burst is about to free.
            match ctx
                .pool
                .persistent_set(&machine.name, Daemon::Startd, ConfigKey::StartJobs, false)
            {
                Ok(()) => {
                    info!("killing {quota} jobs on {}", machine.name);
                    let mut burst_complete = true;
                    for job in machine.preemptable_jobs.iter().take(quota as usize) {
                        match ctx.pool.remove_job(&job.schedd, &job.global_id) {
                            Ok(()) => {
                                killed += 1;
                                debug!("killed {}, started at {}", job.global_id, job.start_time);
                            }
                            Err(err) => {
                                warn!(
                                    "error killing jobs on {}, skipping the rest: {err}",
                                    machine.name
                                );
                                burst_complete = false;
                                break;
                            }
                        }
                    }
                    if burst_complete {
                        // Give the evicted jobs a chance to vacate before
                        // job starts come back on.
                        ctx.pacer.pause(ctx.tunables.vacate_wait);
                    }
                }
                Err(err) => {
                    warn!(
                        "could not pause job starts on {}, skipping the kill burst: {err}",
                        machine.name
                    );
                }
            }
        }

        // Restore normal intake. Losing this write leaves the node unable
        // to run anything until the next cycle retries.
        if let Err(err) = ctx.pool.persistent_set(
            &machine.name,
            Daemon::Startd,
            ConfigKey::PreemptableOnly,
            false,
        ) {
            error!(
                critical = true,
                "could not get {} back to a state fit to run jobs: {err}", machine.name
            );
            continue;
        }
        if let Err(err) =
            ctx.pool
                .persistent_set(&machine.name, Daemon::Startd, ConfigKey::StartJobs, true)
        {
            error!(
                critical = true,
                "could not get {} back to a state fit to run jobs: {err}", machine.name
            );
        }
    }
    killed
}

// ---------------------------------------------------------------------------
// Phase 2: cancel drains above the budget
// ---------------------------------------------------------------------------

/// Walk the draining machines least-killable first and cancel until the
/// count fits the budget. Cancelling the machine with the least progress
/// preserves the most.
fn cancel_excess(
    ctx: &Context<'_>,
    mut machines: Vec<Machine>,
    draining: &mut usize,
    budget: &DrainBudget,
) -> usize {
    machines.sort_by_key(Machine::total_killable_cpus);
    let mut cancelled = 0;
    for machine in &machines {
        if ctx.halt.raised() || *draining <= budget.max_draining || *draining == 0 {
            break;
        }
        match ctx.pool.persistent_set(
            &machine.name,
            Daemon::Startd,
            ConfigKey::PreemptableOnly,
            false,
        ) {
            Ok(()) => {
                info!(
                    "cancel draining {} (killable {})",
                    machine.name,
                    machine.total_killable_cpus()
                );
                *draining -= 1;
                cancelled += 1;
            }
            Err(err) => {
                error!("error cancelling drain on {}, skipping: {err}", machine.name);
            }
        }
    }
    cancelled
}

// ---------------------------------------------------------------------------
// Phase 3: start new drains
// ---------------------------------------------------------------------------

/// Walk the candidates best-ranked first and start drains up to the budget.
fn start_drains(
    ctx: &Context<'_>,
    mut candidates: Vec<Ranked>,
    draining: &mut usize,
    budget: &DrainBudget,
) -> usize {
    candidates.sort_by(|a, b| b.rank.total_cmp(&a.rank));
    let mut started = 0;
    for candidate in &candidates {
        if ctx.halt.raised() || *draining >= budget.max_draining {
            break;
        }
        match ctx.pool.persistent_set(
            &candidate.machine.name,
            Daemon::Startd,
            ConfigKey::PreemptableOnly,
            true,
        ) {
            Ok(()) => {
                info!(
                    "start draining {} (rank {:.2})",
                    candidate.machine.name, candidate.rank
                );
                *draining += 1;
                started += 1;
            }
            Err(err) => {
                error!(
                    "error setting {} to drain, skipping: {err}",
                    candidate.machine.name
                );
            }
        }
    }
    started
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::error::{FatalError, QueryError};
    use crate::facade::{Halt, Pacer, Probe, SchedulerFacade};
    use crate::machine::{Job, JobCounts, StartdAd};
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    // -- recording doubles --------------------------------------------------

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Set {
            machine: String,
            key: &'static str,
            value: bool,
        },
        Remove {
            schedd: String,
            global_id: String,
        },
        Pause(Duration),
    }

    #[derive(Default)]
    struct Recorder {
        ops: Mutex<Vec<Op>>,
        fail_sets: HashSet<(String, &'static str, bool)>,
        fail_removes: HashSet<String>,
    }

    impl Recorder {
        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }
    }

    impl SchedulerFacade for Recorder {
        fn schedd_hosts(&self) -> Result<Vec<String>, FatalError> {
            Ok(Vec::new())
        }
        fn startd_ads(&self, _constraint: &str) -> Result<Vec<StartdAd>, FatalError> {
            Ok(Vec::new())
        }
        fn multicore_counts(&self, _schedd: &str) -> Result<JobCounts, QueryError> {
            Ok(JobCounts::default())
        }
        fn preemptable_job_ids(&self, _schedd: &str) -> Result<Vec<String>, QueryError> {
            Ok(Vec::new())
        }
        fn running_jobs(&self, _machine: &str) -> Result<Vec<Job>, QueryError> {
            Ok(Vec::new())
        }
        fn remove_job(&self, schedd: &str, global_id: &str) -> Result<(), QueryError> {
            if self.fail_removes.contains(global_id) {
                return Err(QueryError::Transport("remove refused".into()));
            }
            self.ops.lock().unwrap().push(Op::Remove {
                schedd: schedd.to_string(),
                global_id: global_id.to_string(),
            });
            Ok(())
        }
        fn persistent_set(
            &self,
            machine: &str,
            _daemon: Daemon,
            key: ConfigKey,
            value: bool,
        ) -> Result<(), QueryError> {
            if self
                .fail_sets
                .contains(&(machine.to_string(), key.name(), value))
            {
                return Err(QueryError::Transport("config write refused".into()));
            }
            self.ops.lock().unwrap().push(Op::Set {
                machine: machine.to_string(),
                key: key.name(),
                value,
            });
            Ok(())
        }
    }

    struct AlwaysUp;
    impl Probe for AlwaysUp {
        fn reachable(&self, _host: &str) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct PauseLog(Mutex<Vec<Duration>>);
    impl Pacer for PauseLog {
        fn pause(&self, wait: Duration) {
            self.0.lock().unwrap().push(wait);
        }
    }

    fn set(machine: &str, key: &'static str, value: bool) -> Op {
        Op::Set {
            machine: machine.to_string(),
            key,
            value,
        }
    }

    fn remove(global_id: &str) -> Op {
        Op::Remove {
            schedd: "sched-01".to_string(),
            global_id: global_id.to_string(),
        }
    }

    fn job(global_id: &str, start_secs: i64) -> Job {
        Job {
            job_id: format!("{global_id}.0"),
            global_id: global_id.to_string(),
            start_time: Utc.timestamp_opt(start_secs, 0).unwrap(),
            schedd: "sched-01".to_string(),
        }
    }

    fn ready_machine(name: &str, total: u32, free: u32, jobs: Vec<Job>) -> Machine {
        let mut machine = Machine::new(name, total, free);
        for j in jobs {
            machine.note_preemptable(j);
        }
        machine
    }

    fn run(
        pool: &Recorder,
        pacer: &PauseLog,
        buckets: Buckets,
        budget: DrainBudget,
    ) -> CycleOutcome {
        let tunables = Tunables::default();
        let probe = AlwaysUp;
        let ctx = Context {
            pool,
            probe: &probe,
            pacer,
            halt: &Halt::default(),
            tunables: &tunables,
        };
        actuate(&ctx, buckets, budget)
    }

    fn open_budget(max_draining: usize) -> DrainBudget {
        DrainBudget {
            max_draining,
            drain_allowed: true,
        }
    }

    // -- phase 1 ------------------------------------------------------------

    #[test]
    fn kill_burst_quiesces_kills_newest_pauses_then_restores() {
        // killable = 10, free = 6: kill the 2 newest of 4 jobs.
        let machine = ready_machine(
            "wn-c",
            16,
            6,
            vec![
                job("c#1", 100),
                job("c#2", 400),
                job("c#3", 300),
                job("c#4", 200),
            ],
        );
        let pool = Recorder::default();
        let pacer = PauseLog::default();
        let buckets = Buckets {
            ready_to_fill: vec![machine],
            ..Buckets::default()
        };
        let outcome = run(&pool, &pacer, buckets, open_budget(0));

        assert_eq!(outcome.jobs_killed, 2);
        assert_eq!(
            pool.ops(),
            vec![
                set("wn-c", "StartJobs", false),
                remove("c#2"),
                remove("c#3"),
                set("wn-c", "PREEMPTABLE_ONLY", false),
                set("wn-c", "StartJobs", true),
            ]
        );
        assert_eq!(
            *pacer.0.lock().unwrap(),
            vec![Duration::from_secs(10)]
        );
    }

    #[test]
    fn zero_quota_still_restores_intake() {
        // killable = 8 with free = 8: nothing to kill, but the writes happen.
        let machine = ready_machine("wn-f", 16, 8, Vec::new());
        let pool = Recorder::default();
        let pacer = PauseLog::default();
        let buckets = Buckets {
            ready_to_fill: vec![machine],
            ..Buckets::default()
        };
        let outcome = run(&pool, &pacer, buckets, open_budget(0));

        assert_eq!(outcome.jobs_killed, 0);
        assert_eq!(
            pool.ops(),
            vec![
                set("wn-f", "PREEMPTABLE_ONLY", false),
                set("wn-f", "StartJobs", true),
            ]
        );
        assert!(pacer.0.lock().unwrap().is_empty());
    }

    #[test]
    fn drain_disallowed_skips_the_burst_but_not_the_restore() {
        let machine = ready_machine(
            "wn-c",
            16,
            6,
            vec![job("c#1", 1), job("c#2", 2), job("c#3", 3), job("c#4", 4)],
        );
        let pool = Recorder::default();
        let pacer = PauseLog::default();
        let buckets = Buckets {
            ready_to_fill: vec![machine],
            ..Buckets::default()
        };
        let budget = DrainBudget {
            max_draining: 0,
            drain_allowed: false,
        };
        let outcome = run(&pool, &pacer, buckets, budget);

        assert_eq!(outcome.jobs_killed, 0);
        assert_eq!(
            pool.ops(),
            vec![
                set("wn-c", "PREEMPTABLE_ONLY", false),
                set("wn-c", "StartJobs", true),
            ]
        );
        assert!(pacer.0.lock().unwrap().is_empty());
    }

    #[test]
    fn quiesce_failure_skips_burst_and_pause() {
        let machine = ready_machine(
            "wn-c",
            16,
            0,
            (0..8).map(|i| job(&format!("c#{i}"), i)).collect(),
        );
        let mut pool = Recorder::default();
        pool.fail_sets
            .insert(("wn-c".to_string(), "StartJobs", false));
        let pacer = PauseLog::default();
        let buckets = Buckets {
            ready_to_fill: vec![machine],
            ..Buckets::default()
        };
        let outcome = run(&pool, &pacer, buckets, open_budget(0));

        assert_eq!(outcome.jobs_killed, 0);
        assert_eq!(
            pool.ops(),
            vec![
                set("wn-c", "PREEMPTABLE_ONLY", false),
                set("wn-c", "StartJobs", true),
            ]
        );
        assert!(pacer.0.lock().unwrap().is_empty());
    }

    #[test]
    fn mid_burst_failure_abandons_the_rest_and_the_pause() {
        let machine = ready_machine(
            "wn-c",
            16,
            6,
            vec![job("c#1", 400), job("c#2", 300), job("c#3", 200), job("c#4", 100)],
        );
        let mut pool = Recorder::default();
        pool.fail_removes.insert("c#2".to_string());
        let pacer = PauseLog::default();
        let buckets = Buckets {
            ready_to_fill: vec![machine],
            ..Buckets::default()
        };
        let outcome = run(&pool, &pacer, buckets, open_budget(0));

        // c#1 killed, c#2 refused, c#3 never attempted.
        assert_eq!(outcome.jobs_killed, 1);
        assert_eq!(
            pool.ops(),
            vec![
                set("wn-c", "StartJobs", false),
                remove("c#1"),
                set("wn-c", "PREEMPTABLE_ONLY", false),
                set("wn-c", "StartJobs", true),
            ]
        );
        assert!(pacer.0.lock().unwrap().is_empty());
    }

    #[test]
    fn restore_failure_skips_the_start_jobs_write() {
        let machine = ready_machine("wn-c", 16, 8, Vec::new());
        let mut pool = Recorder::default();
        pool.fail_sets
            .insert(("wn-c".to_string(), "PREEMPTABLE_ONLY", false));
        let pacer = PauseLog::default();
        let buckets = Buckets {
            ready_to_fill: vec![machine],
            ..Buckets::default()
        };
        run(&pool, &pacer, buckets, open_budget(0));

        assert_eq!(pool.ops(), Vec::<Op>::new());
    }

    // -- phase 2 ------------------------------------------------------------

    fn draining_machine(name: &str, free: u32, preemptable: u32) -> Machine {
        let mut machine = Machine::new(name, 16, free);
        for i in 0..preemptable {
            machine.note_preemptable(job(&format!("{name}#{i}"), i64::from(i)));
        }
        machine
    }

    #[test]
    fn cancels_least_killable_first_until_within_budget() {
        let pool = Recorder::default();
        let pacer = PauseLog::default();
        let buckets = Buckets {
            draining: vec![
                draining_machine("wn-5", 5, 0),
                draining_machine("wn-1", 1, 0),
                draining_machine("wn-4", 4, 0),
                draining_machine("wn-2", 2, 0),
                draining_machine("wn-3", 3, 0),
            ],
            ..Buckets::default()
        };
        let outcome = run(&pool, &pacer, buckets, open_budget(2));

        assert_eq!(outcome.drains_cancelled, 3);
        assert_eq!(outcome.draining, 2);
        assert_eq!(
            pool.ops(),
            vec![
                set("wn-1", "PREEMPTABLE_ONLY", false),
                set("wn-2", "PREEMPTABLE_ONLY", false),
                set("wn-3", "PREEMPTABLE_ONLY", false),
            ]
        );
    }

    #[test]
    fn cancel_failure_keeps_walking() {
        let mut pool = Recorder::default();
        pool.fail_sets
            .insert(("wn-1".to_string(), "PREEMPTABLE_ONLY", false));
        let pacer = PauseLog::default();
        let buckets = Buckets {
            draining: vec![
                draining_machine("wn-1", 1, 0),
                draining_machine("wn-2", 2, 0),
                draining_machine("wn-3", 3, 0),
            ],
            ..Buckets::default()
        };
        let outcome = run(&pool, &pacer, buckets, open_budget(2));

        // wn-1 refused the write; wn-2 brought the count to 2.
        assert_eq!(outcome.drains_cancelled, 1);
        assert_eq!(outcome.draining, 2);
        assert_eq!(pool.ops(), vec![set("wn-2", "PREEMPTABLE_ONLY", false)]);
    }

    // -- phase 3 ------------------------------------------------------------

    fn ranked(name: &str, total: u32, killable: u32) -> Ranked {
        let machine = Machine::new(name, total, killable);
        let rank = f64::from(total - killable) / f64::from(8 - killable);
        Ranked { machine, rank }
    }

    #[test]
    fn starts_best_ranked_first_up_to_budget() {
        let pool = Recorder::default();
        let pacer = PauseLog::default();
        let buckets = Buckets {
            drainable: vec![ranked("wn-a", 16, 3), ranked("wn-b", 32, 3), ranked("wn-c", 8, 0)],
            ..Buckets::default()
        };
        let outcome = run(&pool, &pacer, buckets, open_budget(2));

        assert_eq!(outcome.drains_started, 2);
        assert_eq!(outcome.draining, 2);
        // B (5.8) outranks A (2.6) outranks C (1.0).
        assert_eq!(
            pool.ops(),
            vec![
                set("wn-b", "PREEMPTABLE_ONLY", true),
                set("wn-a", "PREEMPTABLE_ONLY", true),
            ]
        );
    }

    #[test]
    fn start_failure_does_not_consume_budget() {
        let mut pool = Recorder::default();
        pool.fail_sets
            .insert(("wn-b".to_string(), "PREEMPTABLE_ONLY", true));
        let pacer = PauseLog::default();
        let buckets = Buckets {
            drainable: vec![ranked("wn-a", 16, 3), ranked("wn-b", 32, 3)],
            ..Buckets::default()
        };
        let outcome = run(&pool, &pacer, buckets, open_budget(1));

        assert_eq!(outcome.drains_started, 1);
        assert_eq!(pool.ops(), vec![set("wn-a", "PREEMPTABLE_ONLY", true)]);
    }

    #[test]
    fn zero_budget_starts_nothing() {
        let pool = Recorder::default();
        let pacer = PauseLog::default();
        let buckets = Buckets {
            drainable: vec![ranked("wn-a", 16, 3)],
            ..Buckets::default()
        };
        let outcome = run(&pool, &pacer, buckets, open_budget(0));

        assert_eq!(outcome.drains_started, 0);
        assert!(pool.ops().is_empty());
    }

    #[test]
    fn raised_halt_stops_all_phases_before_any_write() {
        let machine = ready_machine("wn-c", 16, 8, Vec::new());
        let pool = Recorder::default();
        let pacer = PauseLog::default();
        let tunables = Tunables::default();
        let probe = AlwaysUp;
        let halt = Halt::default();
        halt.raise();
        let ctx = Context {
            pool: &pool,
            probe: &probe,
            pacer: &pacer,
            halt: &halt,
            tunables: &tunables,
        };
        let buckets = Buckets {
            ready_to_fill: vec![machine],
            draining: vec![draining_machine("wn-d", 1, 0)],
            drainable: vec![ranked("wn-a", 16, 3)],
        };
        let outcome = actuate(&ctx, buckets, open_budget(5));

        assert!(pool.ops().is_empty());
        assert_eq!(outcome.jobs_killed, 0);
        assert_eq!(outcome.drains_started, 0);
        assert_eq!(outcome.drains_cancelled, 0);
    }

    #[test]
    fn existing_drains_count_against_the_budget() {
        let pool = Recorder::default();
        let pacer = PauseLog::default();
        let buckets = Buckets {
            draining: vec![draining_machine("wn-old", 2, 0)],
            drainable: vec![ranked("wn-new", 16, 3)],
            ..Buckets::default()
        };
        let outcome = run(&pool, &pacer, buckets, open_budget(2));

        assert_eq!(outcome.drains_started, 1);
        assert_eq!(outcome.draining, 2);
        assert_eq!(pool.ops(), vec![set("wn-new", "PREEMPTABLE_ONLY", true)]);
    }
}
