//! Error taxonomy for the controller.
//!
//! Two tiers: [`FatalError`] aborts the whole cycle (there is no fleet to
//! act on), while [`QueryError`] degrades to a skip decision at the point
//! it occurs. A failed schedd contributes nothing to the snapshot; a failed
//! machine is revisited next cycle.

use std::time::Duration;
use thiserror::Error;

/// Errors that end the cycle. Each maps to a distinct process exit code.
#[derive(Debug, Error)]
pub enum FatalError {
    /// The collector rejected a trivial self-query.
    #[error("collector unreachable: {0}")]
    CollectorUnreachable(String),

    /// The pool advertises no schedds at all.
    #[error("no schedds found in the pool")]
    NoSchedds,

    /// Transport failure while listing worker-node ads.
    #[error("startd listing failed: {0}")]
    StartdQuery(String),

    /// The startd listing matched nothing; an empty fleet is not actionable.
    #[error("no startds matched the constraint")]
    NoStartds,
}

/// Recoverable per-schedd / per-machine query failure.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The call did not complete within its deadline.
    #[error("query timed out after {after:?}")]
    Timeout { after: Duration },

    /// Transport-level failure talking to a daemon.
    #[error("{0}")]
    Transport(String),

    /// The daemon answered with something we could not interpret.
    #[error("malformed response: {0}")]
    Malformed(String),
}
