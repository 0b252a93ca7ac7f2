//! The HTCondor pool, seen through its command-line tools.
//!
//! Queries go through `condor_status` / `condor_q`, actions through
//! `condor_rm` and `condor_config_val` + `condor_reconfig`. Constraint
//! expressions are passed through to the tools untouched.

use std::time::Duration;

use tracing::{debug, warn};

use defrag_core::{
    ConfigKey, Daemon, FatalError, Job, JobCounts, QueryError, SchedulerFacade, StartdAd,
};

use crate::ads::{parse_ads, RawJobAd, RawStartdAd};
use crate::run::CommandRunner;

const CONDOR_STATUS: &str = "condor_status";
const CONDOR_Q: &str = "condor_q";
const CONDOR_RM: &str = "condor_rm";
const CONDOR_CONFIG_VAL: &str = "condor_config_val";
const CONDOR_RECONFIG: &str = "condor_reconfig";

/// Attributes the classifier reads off a partitionable-slot ad.
const STARTD_PROJECTION: &str = "Machine,TotalCpus,Cpus,PartitionableSlot,PREEMPTABLE_ONLY,NODE_IS_HEALTHY,StartJobs,ShouldHibernate,KILL_SIGNAL,EFFICIENT_DRAIN";

/// Attributes identifying a job running on a child slot.
const JOB_PROJECTION: &str = "JobId,ClientMachine,GlobalJobId,EnteredCurrentActivity";

fn condor_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Facade over one HTCondor pool.
#[derive(Debug, Clone)]
pub struct CondorPool {
    runner: CommandRunner,
    pool: Option<String>,
}

impl CondorPool {
    /// Connect to the pool's collector (the local one when `pool` is
    /// `None`), verifying it with a trivial self-query.
    pub fn connect(pool: Option<String>, query_timeout: Duration) -> Result<Self, FatalError> {
        let this = CondorPool {
            runner: CommandRunner::new(query_timeout),
            pool,
        };
        this.runner
            .run(
                CONDOR_STATUS,
                &this.with_pool(&["-collector", "-af", "Name"]),
            )
            .map_err(|err| FatalError::CollectorUnreachable(err.to_string()))?;
        Ok(this)
    }

    fn with_pool(&self, args: &[&str]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(host) = &self.pool {
            full.push("-pool".to_string());
            full.push(host.clone());
        }
        full.extend(args.iter().map(|s| s.to_string()));
        full
    }

    fn lines(output: &str) -> Vec<String> {
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl SchedulerFacade for CondorPool {
    fn schedd_hosts(&self) -> Result<Vec<String>, FatalError> {
        let out = self
            .runner
            .run(CONDOR_STATUS, &self.with_pool(&["-schedd", "-af", "Name"]))
            .map_err(|err| FatalError::CollectorUnreachable(err.to_string()))?;
        Ok(Self::lines(&out))
    }

    fn startd_ads(&self, constraint: &str) -> Result<Vec<StartdAd>, FatalError> {
        let out = self
            .runner
            .run(
                CONDOR_STATUS,
                &self.with_pool(&[
                    "-json",
                    "-constraint",
                    constraint,
                    "-attributes",
                    STARTD_PROJECTION,
                ]),
            )
            .map_err(|err| FatalError::StartdQuery(err.to_string()))?;
        let raw: Vec<RawStartdAd> =
            parse_ads(&out).map_err(|err| FatalError::StartdQuery(err.to_string()))?;

        let mut ads = Vec::with_capacity(raw.len());
        for ad in raw {
            match ad.into_startd() {
                Ok(ad) => ads.push(ad),
                Err(err) => warn!("discarding startd ad: {err}"),
            }
        }
        Ok(ads)
    }

    fn multicore_counts(&self, schedd: &str) -> Result<JobCounts, QueryError> {
        let out = self.runner.run(
            CONDOR_Q,
            &self.with_pool(&[
                "-name",
                schedd,
                "-constraint",
                "RequestCpus > 1",
                "-af",
                "JobStatus",
            ]),
        )?;
        let mut counts = JobCounts::default();
        for line in Self::lines(&out) {
            match line.parse::<i64>() {
                Ok(2) => counts.running += 1,
                Ok(1) => counts.idle += 1,
                Ok(_) => {}
                Err(_) => debug!("ignoring unparsable JobStatus {line:?} from {schedd}"),
            }
        }
        Ok(counts)
    }

    fn preemptable_job_ids(&self, schedd: &str) -> Result<Vec<String>, QueryError> {
        let out = self.runner.run(
            CONDOR_Q,
            &self.with_pool(&[
                "-name",
                schedd,
                "-constraint",
                "isPreemptable =?= True",
                "-af",
                "GlobalJobId",
            ]),
        )?;
        Ok(Self::lines(&out))
    }

    fn running_jobs(&self, machine: &str) -> Result<Vec<Job>, QueryError> {
        let constraint = format!("Machine == \"{machine}\"");
        let out = self.runner.run(
            CONDOR_STATUS,
            &self.with_pool(&[
                "-json",
                "-constraint",
                &constraint,
                "-attributes",
                JOB_PROJECTION,
            ]),
        )?;
        let raw: Vec<RawJobAd> =
            parse_ads(&out).map_err(|err| QueryError::Malformed(err.to_string()))?;

        let mut jobs = Vec::new();
        for ad in raw {
            match ad.into_job() {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(err) => warn!("discarding job ad on {machine}: {err}"),
            }
        }
        Ok(jobs)
    }

    fn remove_job(&self, schedd: &str, global_id: &str) -> Result<(), QueryError> {
        let constraint = format!("GlobalJobId == \"{global_id}\"");
        self.runner.run(
            CONDOR_RM,
            &self.with_pool(&["-name", schedd, "-constraint", &constraint]),
        )?;
        Ok(())
    }

    fn persistent_set(
        &self,
        machine: &str,
        daemon: Daemon,
        key: ConfigKey,
        value: bool,
    ) -> Result<(), QueryError> {
        let assignment = format!("{} = {}", key.name(), condor_bool(value));
        self.runner.run(
            CONDOR_CONFIG_VAL,
            &self.with_pool(&["-name", machine, daemon.flag(), "-set", &assignment]),
        )?;
        self.runner
            .run(CONDOR_RECONFIG, &self.with_pool(&["-name", machine]))?;
        debug!(
            "set {machine} {} {} = {} persistently",
            daemon.flag(),
            key.name(),
            condor_bool(value)
        );
        Ok(())
    }
}
