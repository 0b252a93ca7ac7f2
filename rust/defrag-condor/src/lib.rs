//! HTCondor backend for the defragmentation controller.
//!
//! Implements the scheduler facade over the pool's command-line tools and
//! the reachability probe over `ping`. Nothing above this crate knows how a
//! query is phrased on the wire.

mod ads;
mod ping;
mod pool;
mod run;

pub use ads::AdError;
pub use ping::PingProbe;
pub use pool::CondorPool;
pub use run::{CommandError, CommandRunner};
