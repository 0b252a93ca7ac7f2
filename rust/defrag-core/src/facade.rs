//! Seams between the control loop and the outside world.
//!
//! The controller's algorithms only ever talk to these traits; how a query
//! is expressed on the wire (native RPC, tool invocation, a test mock) is
//! the implementation's business. A [`Context`] bundles the seams with the
//! tunables so every stage receives one explicit argument instead of
//! reaching for globals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::Tunables;
use crate::error::{FatalError, QueryError};
use crate::machine::{Job, JobCounts, StartdAd};

// ---------------------------------------------------------------------------
// Persistent-config addressing
// ---------------------------------------------------------------------------

/// Daemon a persistent configuration write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Daemon {
    Startd,
}

impl Daemon {
    /// Scheduler-side spelling of the daemon selector.
    pub fn flag(self) -> &'static str {
        match self {
            Daemon::Startd => "-startd",
        }
    }
}

/// Configuration keys the controller writes. Spelled exactly as the target
/// scheduler knows them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    StartJobs,
    PreemptableOnly,
}

impl ConfigKey {
    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::StartJobs => "StartJobs",
            ConfigKey::PreemptableOnly => "PREEMPTABLE_ONLY",
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulerFacade
// ---------------------------------------------------------------------------

/// Abstract capability set over the batch scheduler.
///
/// Fatal-vs-recoverable policy is encoded in the signatures: collector-level
/// listings return [`FatalError`], per-schedd and per-machine operations
/// return [`QueryError`] and degrade to skips at the call site.
pub trait SchedulerFacade: Sync {
    /// Hosts running a schedd. Emptiness is judged by the caller.
    fn schedd_hosts(&self) -> Result<Vec<String>, FatalError>;

    /// Worker-node ads matching `constraint` (opaque filter expression).
    fn startd_ads(&self, constraint: &str) -> Result<Vec<StartdAd>, FatalError>;

    /// Running/idle multicore job counts on one schedd.
    fn multicore_counts(&self, schedd: &str) -> Result<JobCounts, QueryError>;

    /// Global ids of jobs flagged preemptable on one schedd.
    fn preemptable_job_ids(&self, schedd: &str) -> Result<Vec<String>, QueryError>;

    /// Jobs currently running on the named machine.
    fn running_jobs(&self, machine: &str) -> Result<Vec<Job>, QueryError>;

    /// Remove one job, routed through the schedd that owns it.
    fn remove_job(&self, schedd: &str, global_id: &str) -> Result<(), QueryError>;

    /// Write a persistent configuration pair on the remote daemon and
    /// reconfigure it. Persistent means it survives node reboots.
    fn persistent_set(
        &self,
        machine: &str,
        daemon: Daemon,
        key: ConfigKey,
        value: bool,
    ) -> Result<(), QueryError>;
}

// ---------------------------------------------------------------------------
// Probe and Pacer
// ---------------------------------------------------------------------------

/// Host reachability. `false` is never an error, just a skip.
pub trait Probe: Sync {
    fn reachable(&self, host: &str) -> bool;
}

/// Wall-clock pauses, behind a seam like everything else that blocks.
pub trait Pacer: Sync {
    fn pause(&self, wait: Duration);
}

/// Production pacer: really sleeps.
#[derive(Debug, Default)]
pub struct WallClock;

impl Pacer for WallClock {
    fn pause(&self, wait: Duration) {
        std::thread::sleep(wait);
    }
}

// ---------------------------------------------------------------------------
// Halt
// ---------------------------------------------------------------------------

/// Cooperative shutdown flag.
///
/// A signal handler raises it; the actuator checks it between machines, so
/// the action in hand always completes and no node is left quiesced
/// half-way through its write sequence.
#[derive(Debug, Default)]
pub struct Halt(AtomicBool);

impl Halt {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a cycle stage needs, passed explicitly.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub pool: &'a dyn SchedulerFacade,
    pub probe: &'a dyn Probe,
    pub pacer: &'a dyn Pacer,
    pub halt: &'a Halt,
    pub tunables: &'a Tunables,
}
