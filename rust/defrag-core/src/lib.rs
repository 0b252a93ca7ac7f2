//! Core of the efficient-defragmentation controller.
//!
//! A periodic control loop over a batch farm that steers worker nodes
//! toward a state where a multicore job can land: it picks nodes to drain
//! (accept only preemptable jobs), stops drains once enough CPUs are
//! killable, and evicts just enough preemptable jobs to clear a
//! target-sized block of CPUs.
//!
//! The crate is deliberately scheduler-agnostic: everything talks to the
//! [`facade::SchedulerFacade`] / [`facade::Probe`] / [`facade::Pacer`]
//! seams, so the whole loop runs against mocks in tests and against the
//! HTCondor command-line tools in production.

pub mod actuate;
pub mod classify;
pub mod config;
pub mod cycle;
pub mod error;
pub mod facade;
pub mod governor;
pub mod machine;
pub mod snapshot;

pub use actuate::CycleOutcome;
pub use config::{ConfigError, Tunables};
pub use cycle::run_cycle;
pub use error::{FatalError, QueryError};
pub use facade::{ConfigKey, Context, Daemon, Halt, Pacer, Probe, SchedulerFacade, WallClock};
pub use machine::{Job, JobCounts, Machine, PreemptableSet, StartdAd};
