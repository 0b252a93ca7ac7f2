//! Bounded invocation of the HTCondor command-line tools.
//!
//! Every call the controller makes is a potentially blocking network
//! operation, so every child process gets a deadline. Output pipes are
//! drained on their own threads; a chatty tool must never deadlock
//! against a full pipe buffer while we wait for it to exit.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use defrag_core::QueryError;

/// How often to check a running child against its deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
    #[error("{tool} did not finish within {after:?}")]
    Timeout { tool: String, after: Duration },
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },
}

impl From<CommandError> for QueryError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Timeout { after, .. } => QueryError::Timeout { after },
            other => QueryError::Transport(other.to_string()),
        }
    }
}

/// Runs one tool at a time with a fixed per-call deadline.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        CommandRunner { timeout }
    }

    /// Run `tool` with `args`, returning its stdout on success.
    pub fn run(&self, tool: &str, args: &[String]) -> Result<String, CommandError> {
        let mut child = Command::new(tool)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                tool: tool.to_string(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CommandError::Timeout {
                        tool: tool.to_string(),
                        after: self.timeout,
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => {
                    let _ = child.kill();
                    return Err(CommandError::Spawn {
                        tool: tool.to_string(),
                        source,
                    });
                }
            }
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);
        if status.success() {
            Ok(stdout)
        } else {
            Err(CommandError::Failed {
                tool: tool.to_string(),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut reader| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = reader.read_to_string(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
