//! `efficientdefrag`: one defragmentation cycle, then exit.
//!
//! Meant to run from cron. Takes no required arguments; flags exist only to
//! override paths and the collector for testing and staged rollouts. Exit
//! codes are distinct per failure class so the wrapper scripts can tell
//! "already running" from "pool is down".

mod lock;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, warn};

use defrag_condor::{CondorPool, PingProbe};
use defrag_core::{run_cycle, ConfigError, Context, FatalError, Halt, Tunables, WallClock};
use lock::{LockError, LockHolder};

const EXIT_CONFIG: u8 = 1;
const EXIT_LOCK_HELD: u8 = 2;
const EXIT_NO_COLLECTOR: u8 = 3;
const EXIT_NO_SCHEDDS: u8 = 4;
const EXIT_NO_STARTDS: u8 = 5;

#[derive(Debug, Parser)]
#[command(
    name = "efficientdefrag",
    version,
    about = "Steer batch worker nodes toward a state where a multicore job can land"
)]
struct Cli {
    /// Collector host to query (defaults to the local pool)
    #[arg(long)]
    pool: Option<String>,

    /// TOML file overriding the built-in tunables
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Lock file preventing overlapping runs
    #[arg(long, value_name = "FILE")]
    lock_file: Option<PathBuf>,

    /// Flag file that inhibits all draining while it exists
    #[arg(long, value_name = "FILE")]
    inhibit_file: Option<PathBuf>,

    /// Log filter (EnvFilter syntax)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let tunables = match build_tunables(&cli) {
        Ok(tunables) => tunables,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // Held until process exit; overlapping cron fires bow out here.
    let _lock = match LockHolder::acquire(&tunables.lock_file) {
        Ok(lock) => lock,
        Err(err @ LockError::Held { .. }) => {
            error!("defrag is already running: {err}");
            return ExitCode::from(EXIT_LOCK_HELD);
        }
        Err(err) => {
            error!("{err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let pool = match CondorPool::connect(tunables.pool.clone(), tunables.query_timeout) {
        Ok(pool) => pool,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(EXIT_NO_COLLECTOR);
        }
    };
    let probe = PingProbe::new(tunables.ping_timeout);
    let pacer = WallClock;

    // On SIGINT/SIGTERM, finish the machine in hand and end the cycle
    // early rather than dying with a node quiesced.
    let halt = Arc::new(Halt::default());
    {
        let halt = Arc::clone(&halt);
        if let Err(err) = ctrlc::set_handler(move || halt.raise()) {
            warn!("could not install the signal handler: {err}");
        }
    }

    let ctx = Context {
        pool: &pool,
        probe: &probe,
        pacer: &pacer,
        halt: &halt,
        tunables: &tunables,
    };

    match run_cycle(&ctx) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(fatal_exit_code(&err))
        }
    }
}

fn build_tunables(cli: &Cli) -> Result<Tunables, ConfigError> {
    let mut tunables = match &cli.config {
        Some(path) => Tunables::from_file(path)?,
        None => Tunables::default(),
    };
    if cli.pool.is_some() {
        tunables.pool = cli.pool.clone();
    }
    if let Some(path) = &cli.lock_file {
        tunables.lock_file = path.clone();
    }
    if let Some(path) = &cli.inhibit_file {
        tunables.inhibit_file = path.clone();
    }
    Ok(tunables)
}

fn fatal_exit_code(err: &FatalError) -> u8 {
    match err {
        FatalError::CollectorUnreachable(_) | FatalError::StartdQuery(_) => EXIT_NO_COLLECTOR,
        FatalError::NoSchedds => EXIT_NO_SCHEDDS,
        FatalError::NoStartds => EXIT_NO_STARTDS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn runs_without_any_arguments() {
        let cli = Cli::try_parse_from(["efficientdefrag"]).unwrap();
        assert!(cli.pool.is_none());
        assert!(cli.config.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn flags_override_tunable_paths() {
        let cli = Cli::try_parse_from([
            "efficientdefrag",
            "--pool",
            "collector.example.org",
            "--lock-file",
            "/tmp/defrag.lock",
            "--inhibit-file",
            "/tmp/nodrain",
        ])
        .unwrap();
        let tunables = build_tunables(&cli).unwrap();
        assert_eq!(tunables.pool.as_deref(), Some("collector.example.org"));
        assert_eq!(tunables.lock_file, PathBuf::from("/tmp/defrag.lock"));
        assert_eq!(tunables.inhibit_file, PathBuf::from("/tmp/nodrain"));
    }

    #[test]
    fn each_fatal_error_has_a_distinct_exit_code() {
        let codes = [
            fatal_exit_code(&FatalError::CollectorUnreachable("down".into())),
            fatal_exit_code(&FatalError::NoSchedds),
            fatal_exit_code(&FatalError::NoStartds),
        ];
        assert_eq!(codes, [EXIT_NO_COLLECTOR, EXIT_NO_SCHEDDS, EXIT_NO_STARTDS]);
        assert!(!codes.contains(&EXIT_LOCK_HELD));
        assert!(!codes.contains(&0));
    }
}
