//! Cycle-scoped data model: worker nodes, their jobs, and fleet-wide
//! aggregates. Everything here is materialised from one snapshot and
//! discarded at cycle end; the batch scheduler remains the authority.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One running job instance on a worker node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Scheduler-local handle (e.g. `1234.0`).
    pub job_id: String,
    /// Cluster-wide unique identifier; also the key into the preemptable set.
    pub global_id: String,
    /// Instant the job entered its current activity.
    pub start_time: DateTime<Utc>,
    /// Submit host owning the job; remove actions are routed there.
    pub schedd: String,
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// One worker node, as seen through its partitionable-slot ad plus the
/// running jobs discovered on it.
#[derive(Debug, Clone, Default)]
pub struct Machine {
    /// Fully-qualified host name (unique key).
    pub name: String,
    /// CPUs on the machine.
    pub total_cpus: u32,
    /// Unallocated CPUs on the partitionable slot.
    pub num_free: u32,
    /// Running preemptable jobs, one CPU each.
    pub num_preemptable: u32,
    /// The preemptable jobs themselves, in discovery order.
    pub preemptable_jobs: Vec<Job>,
}

impl Machine {
    pub fn new(name: impl Into<String>, total_cpus: u32, num_free: u32) -> Self {
        Machine {
            name: name.into(),
            total_cpus,
            num_free,
            num_preemptable: 0,
            preemptable_jobs: Vec::new(),
        }
    }

    /// CPUs that are free already or freeable by killing preemptable jobs.
    pub fn total_killable_cpus(&self) -> u32 {
        self.num_free + self.num_preemptable
    }

    /// Record one more preemptable job running here.
    pub fn note_preemptable(&mut self, job: Job) {
        self.num_preemptable += 1;
        self.preemptable_jobs.push(job);
    }

    /// How many preemptable jobs to evict so that the free CPUs reach the
    /// next multiple of `target` at or below the killable total.
    pub fn kill_quota(&self, target: u32) -> u32 {
        let reachable = target * (self.total_killable_cpus() / target);
        reachable.saturating_sub(self.num_free)
    }

    /// Order the preemptable jobs newest-first: the youngest jobs have done
    /// the least work and are the cheapest to kill.
    pub fn sort_jobs_newest_first(&mut self) {
        self.preemptable_jobs
            .sort_by(|a, b| b.start_time.cmp(&a.start_time));
    }
}

// ---------------------------------------------------------------------------
// Fleet-wide aggregates
// ---------------------------------------------------------------------------

/// Counts of multicore jobs (`RequestCpus > 1`) across all schedds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub running: u64,
    pub idle: u64,
}

impl JobCounts {
    pub fn merge(&mut self, other: JobCounts) {
        self.running += other.running;
        self.idle += other.idle;
    }
}

/// Global job identifiers currently flagged preemptable, unioned across all
/// schedds. Membership decides whether a running job may be killed.
pub type PreemptableSet = HashSet<String>;

// ---------------------------------------------------------------------------
// StartdAd
// ---------------------------------------------------------------------------

/// The slice of a partitionable-slot ad the classifier cares about.
///
/// Optional fields model attributes the startd may simply not expose;
/// exposure itself is part of the eligibility test.
#[derive(Debug, Clone, Default)]
pub struct StartdAd {
    pub machine: String,
    pub total_cpus: u32,
    /// CPUs on the slot; for a partitionable slot this is the free count.
    pub free_cpus: u32,
    pub partitionable: bool,
    pub preemptable_only: Option<bool>,
    pub healthy: Option<bool>,
    pub start_jobs: bool,
    pub should_hibernate: bool,
    pub kill_signal: bool,
    pub efficient_drain: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(global_id: &str, start_secs: i64) -> Job {
        Job {
            job_id: format!("{global_id}.0"),
            global_id: global_id.to_string(),
            start_time: Utc.timestamp_opt(start_secs, 0).unwrap(),
            schedd: "sched-01.example.org".to_string(),
        }
    }

    #[test]
    fn killable_is_free_plus_preemptable() {
        let mut m = Machine::new("wn-001", 16, 6);
        m.note_preemptable(job("a#1", 100));
        m.note_preemptable(job("a#2", 200));
        assert_eq!(m.total_killable_cpus(), 8);
    }

    #[test]
    fn kill_quota_reaches_next_multiple_of_target() {
        // killable = 10, free = 6 -> quota lands free CPUs on 8.
        let mut m = Machine::new("wn-002", 16, 6);
        for i in 0..4 {
            m.note_preemptable(job(&format!("b#{i}"), i));
        }
        assert_eq!(m.kill_quota(8), 2);
    }

    #[test]
    fn kill_quota_zero_when_below_target() {
        let mut m = Machine::new("wn-003", 16, 2);
        m.note_preemptable(job("c#1", 1));
        // killable = 3 < 8: nothing to gain by killing.
        assert_eq!(m.kill_quota(8), 0);
    }

    #[test]
    fn kill_quota_full_target_when_nothing_free() {
        let mut m = Machine::new("wn-004", 16, 0);
        for i in 0..8 {
            m.note_preemptable(job(&format!("d#{i}"), i));
        }
        assert_eq!(m.kill_quota(8), 8);
    }

    #[test]
    fn kill_quota_plus_free_is_multiple_of_target() {
        for free in 0..12u32 {
            for preemptable in 0..12u32 {
                let mut m = Machine::new("wn-x", 32, free);
                for i in 0..preemptable {
                    m.note_preemptable(job(&format!("e#{i}"), i64::from(i)));
                }
                let quota = m.kill_quota(8);
                let freed = m.num_free + quota;
                if m.total_killable_cpus() >= 8 {
                    assert_eq!(freed % 8, 0, "free={free} preemptable={preemptable}");
                }
                assert!(freed <= m.total_killable_cpus());
            }
        }
    }

    #[test]
    fn newest_first_ordering() {
        let mut m = Machine::new("wn-005", 8, 0);
        m.note_preemptable(job("old", 100));
        m.note_preemptable(job("newest", 900));
        m.note_preemptable(job("mid", 500));
        m.sort_jobs_newest_first();
        let order: Vec<&str> = m
            .preemptable_jobs
            .iter()
            .map(|j| j.global_id.as_str())
            .collect();
        assert_eq!(order, vec!["newest", "mid", "old"]);
    }

    #[test]
    fn job_counts_merge() {
        let mut counts = JobCounts::default();
        counts.merge(JobCounts {
            running: 4,
            idle: 1,
        });
        counts.merge(JobCounts {
            running: 0,
            idle: 30,
        });
        assert_eq!(
            counts,
            JobCounts {
                running: 4,
                idle: 31
            }
        );
    }
}
