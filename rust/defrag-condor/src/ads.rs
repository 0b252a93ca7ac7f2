//! ClassAd-JSON parsing.
//!
//! `condor_status -json` output is loosely typed: booleans sometimes arrive
//! as the strings `"True"`/`"False"` (notably for knobs set through
//! config), and counts may be integers or floats. The `Ad*` helper enums
//! absorb that before anything reaches the typed model.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;

use defrag_core::{Job, StartdAd};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdError {
    #[error("ad is missing attribute {0}")]
    Missing(&'static str),
    #[error("attribute {0} has an unusable value")]
    Invalid(&'static str),
}

// ---------------------------------------------------------------------------
// Lax scalar wrappers
// ---------------------------------------------------------------------------

/// A boolean that may be a JSON bool or a "True"/"False" string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum AdBool {
    Flag(bool),
    Text(String),
}

impl AdBool {
    fn as_bool(&self) -> bool {
        match self {
            AdBool::Flag(b) => *b,
            AdBool::Text(s) => s.eq_ignore_ascii_case("true"),
        }
    }
}

/// A count that may be an integer or a float (`TotalCpus` is often `16.0`).
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub(crate) enum AdNum {
    Int(i64),
    Float(f64),
}

impl AdNum {
    fn as_u32(self) -> Option<u32> {
        match self {
            AdNum::Int(v) => u32::try_from(v).ok(),
            AdNum::Float(v) if v.is_finite() && v >= 0.0 => Some(v as u32),
            AdNum::Float(_) => None,
        }
    }

    fn as_i64(self) -> Option<i64> {
        match self {
            AdNum::Int(v) => Some(v),
            AdNum::Float(v) if v.is_finite() => Some(v as i64),
            AdNum::Float(_) => None,
        }
    }
}

/// An identifier that may be a string or a bare number.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum AdText {
    Text(String),
    Int(i64),
    Float(f64),
}

impl AdText {
    fn into_string(self) -> String {
        match self {
            AdText::Text(s) => s,
            AdText::Int(v) => v.to_string(),
            AdText::Float(v) => v.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Startd ads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct RawStartdAd {
    #[serde(rename = "Machine")]
    machine: Option<String>,
    #[serde(rename = "TotalCpus")]
    total_cpus: Option<AdNum>,
    #[serde(rename = "Cpus")]
    cpus: Option<AdNum>,
    #[serde(rename = "PartitionableSlot")]
    partitionable_slot: Option<AdBool>,
    #[serde(rename = "PREEMPTABLE_ONLY")]
    preemptable_only: Option<AdBool>,
    #[serde(rename = "NODE_IS_HEALTHY")]
    node_is_healthy: Option<AdBool>,
    #[serde(rename = "StartJobs")]
    start_jobs: Option<AdBool>,
    #[serde(rename = "ShouldHibernate")]
    should_hibernate: Option<AdBool>,
    #[serde(rename = "KILL_SIGNAL")]
    kill_signal: Option<AdBool>,
    #[serde(rename = "EFFICIENT_DRAIN")]
    efficient_drain: Option<AdBool>,
}

impl RawStartdAd {
    pub(crate) fn into_startd(self) -> Result<StartdAd, AdError> {
        let machine = self.machine.ok_or(AdError::Missing("Machine"))?;
        let total_cpus = self
            .total_cpus
            .ok_or(AdError::Missing("TotalCpus"))?
            .as_u32()
            .ok_or(AdError::Invalid("TotalCpus"))?;
        let free_cpus = self
            .cpus
            .ok_or(AdError::Missing("Cpus"))?
            .as_u32()
            .ok_or(AdError::Invalid("Cpus"))?;
        Ok(StartdAd {
            machine,
            total_cpus,
            free_cpus,
            partitionable: self.partitionable_slot.is_some_and(|b| b.as_bool()),
            preemptable_only: self.preemptable_only.map(|b| b.as_bool()),
            healthy: self.node_is_healthy.map(|b| b.as_bool()),
            start_jobs: self.start_jobs.is_some_and(|b| b.as_bool()),
            should_hibernate: self.should_hibernate.is_some_and(|b| b.as_bool()),
            kill_signal: self.kill_signal.is_some_and(|b| b.as_bool()),
            efficient_drain: self.efficient_drain.is_some_and(|b| b.as_bool()),
        })
    }
}

// ---------------------------------------------------------------------------
// Job ads (child slots)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct RawJobAd {
    #[serde(rename = "JobId")]
    job_id: Option<AdText>,
    #[serde(rename = "GlobalJobId")]
    global_job_id: Option<String>,
    #[serde(rename = "ClientMachine")]
    client_machine: Option<String>,
    #[serde(rename = "EnteredCurrentActivity")]
    entered_current_activity: Option<AdNum>,
}

impl RawJobAd {
    /// `Ok(None)` for slot ads with no job on them (an idle child or the
    /// partitionable parent itself).
    pub(crate) fn into_job(self) -> Result<Option<Job>, AdError> {
        let Some(job_id) = self.job_id else {
            return Ok(None);
        };
        let global_id = self.global_job_id.ok_or(AdError::Missing("GlobalJobId"))?;
        let schedd = self
            .client_machine
            .ok_or(AdError::Missing("ClientMachine"))?;
        let start_secs = self
            .entered_current_activity
            .ok_or(AdError::Missing("EnteredCurrentActivity"))?
            .as_i64()
            .ok_or(AdError::Invalid("EnteredCurrentActivity"))?;
        let start_time: DateTime<Utc> = Utc
            .timestamp_opt(start_secs, 0)
            .single()
            .ok_or(AdError::Invalid("EnteredCurrentActivity"))?;
        Ok(Some(Job {
            job_id: job_id.into_string(),
            global_id,
            start_time,
            schedd,
        }))
    }
}

// ---------------------------------------------------------------------------
// Top-level parsing
// ---------------------------------------------------------------------------

/// Parse a `-json` tool response. The tools print nothing at all when no ad
/// matches, so blank output means an empty list.
pub(crate) fn parse_ads<T>(json: &str) -> Result<Vec<T>, serde_json::Error>
where
    T: for<'de> Deserialize<'de>,
{
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed)
}
