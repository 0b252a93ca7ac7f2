//! Tunables for the controller, with an optional TOML overlay.
//!
//! Compiled defaults match the production deployment; a config file can
//! override any subset, and command-line flags win over both. File format:
//!
//! ```toml
//! pool = "collector.example.org"
//! target_cpus = 8
//! idle_high = 20
//! running_high = 300
//! concurrency_low = 20
//! concurrency_high = 60
//! concurrency_default = 2
//! vacate_wait_secs = 10
//! ping_timeout_secs = 2
//! query_timeout_secs = 10
//! fan_out = 16
//! inhibit_file = "/etc/nodrain"
//! lock_file = "/var/run/efficientDrainingRunning"
//! startd_constraint = '...'
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Worker-node ads to consider: everything except the cloud, test and
/// hypervisor clusters. Passed through to the scheduler unchanged.
pub const DEFAULT_STARTD_CONSTRAINT: &str = "RalCluster =!= \"wn-cloud\" && ClusterName =!= \"wn-test\" && RalCluster =!= \"vm-nubes\" && RalCluster =!= \"vm-hyperv\"";

/// Presence of this file inhibits all draining.
pub const DEFAULT_INHIBIT_FILE: &str = "/etc/nodrain";

/// Advisory lock preventing overlapping runs.
pub const DEFAULT_LOCK_FILE: &str = "/var/run/efficientDrainingRunning";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

/// Runtime knobs for a cycle. One instance is built at startup and passed
/// by reference everywhere; nothing here mutates mid-cycle.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Collector host; `None` queries the local pool.
    pub pool: Option<String>,
    /// Size of the multicore job we defragment for.
    pub target_cpus: u32,
    /// Idle multicore jobs above this signal demand.
    pub idle_high: u64,
    /// Running multicore jobs above this signal a farm already busy with them.
    pub running_high: u64,
    /// Max concurrent drains when demand is high but the farm is busy.
    pub concurrency_low: usize,
    /// Max concurrent drains under high demand.
    pub concurrency_high: usize,
    /// Max concurrent drains in the quiet state.
    pub concurrency_default: usize,
    /// Pause between a kill burst and re-enabling job starts.
    pub vacate_wait: Duration,
    /// Reachability probe deadline.
    pub ping_timeout: Duration,
    /// Per-call deadline for scheduler queries and actions.
    pub query_timeout: Duration,
    /// Worker-pool width for the per-machine probe/job-fetch fan-out.
    pub fan_out: usize,
    /// Startd filter expression, passed through opaquely.
    pub startd_constraint: String,
    /// Existence of this path forces `max_draining = 0`.
    pub inhibit_file: PathBuf,
    /// Exclusive lock taken for the lifetime of the process.
    pub lock_file: PathBuf,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            pool: None,
            target_cpus: 8,
            idle_high: 20,
            running_high: 300,
            concurrency_low: 20,
            concurrency_high: 60,
            concurrency_default: 2,
            vacate_wait: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(2),
            query_timeout: Duration::from_secs(10),
            fan_out: 16,
            startd_constraint: DEFAULT_STARTD_CONSTRAINT.to_string(),
            inhibit_file: PathBuf::from(DEFAULT_INHIBIT_FILE),
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
        }
    }
}

impl Tunables {
    /// Defaults overlaid with the given config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let overlay: ConfigFile =
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let mut tunables = Tunables::default();
        overlay.apply(&mut tunables);
        Ok(tunables)
    }
}

// ---------------------------------------------------------------------------
// File overlay
// ---------------------------------------------------------------------------

/// On-disk representation: every field optional, absent means "keep the
/// default".
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    pool: Option<String>,
    target_cpus: Option<u32>,
    idle_high: Option<u64>,
    running_high: Option<u64>,
    concurrency_low: Option<usize>,
    concurrency_high: Option<usize>,
    concurrency_default: Option<usize>,
    vacate_wait_secs: Option<u64>,
    ping_timeout_secs: Option<u64>,
    query_timeout_secs: Option<u64>,
    fan_out: Option<usize>,
    startd_constraint: Option<String>,
    inhibit_file: Option<PathBuf>,
    lock_file: Option<PathBuf>,
}

impl ConfigFile {
    fn apply(self, t: &mut Tunables) {
        if self.pool.is_some() {
            t.pool = self.pool;
        }
        if let Some(v) = self.target_cpus {
            t.target_cpus = v;
        }
        if let Some(v) = self.idle_high {
            t.idle_high = v;
        }
        if let Some(v) = self.running_high {
            t.running_high = v;
        }
        if let Some(v) = self.concurrency_low {
            t.concurrency_low = v;
        }
        if let Some(v) = self.concurrency_high {
            t.concurrency_high = v;
        }
        if let Some(v) = self.concurrency_default {
            t.concurrency_default = v;
        }
        if let Some(v) = self.vacate_wait_secs {
            t.vacate_wait = Duration::from_secs(v);
        }
        if let Some(v) = self.ping_timeout_secs {
            t.ping_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.query_timeout_secs {
            t.query_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.fan_out {
            t.fan_out = v;
        }
        if let Some(v) = self.startd_constraint {
            t.startd_constraint = v;
        }
        if let Some(v) = self.inhibit_file {
            t.inhibit_file = v;
        }
        if let Some(v) = self.lock_file {
            t.lock_file = v;
        }
    }
}
