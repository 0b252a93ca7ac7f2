//! Host reachability via the system `ping` binary.
//!
//! One echo request with a short deadline. Raw ICMP sockets need elevated
//! privileges; `ping` is setuid everywhere this runs and its exit status is
//! all we need. Any failure (spawn error, timeout, non-zero exit) just
//! means "skip this machine for the cycle".

use std::process::{Command, Stdio};
use std::time::Duration;

use defrag_core::Probe;

#[derive(Debug, Clone)]
pub struct PingProbe {
    timeout: Duration,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        PingProbe { timeout }
    }

    fn deadline_secs(&self) -> u64 {
        self.timeout.as_secs().max(1)
    }
}

impl Probe for PingProbe {
    fn reachable(&self, host: &str) -> bool {
        Command::new("ping")
            .args(["-c", "1", "-W", &self.deadline_secs().to_string(), host])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}
