//! jobpilot - autonomous job-application orchestrator CLI.
//!
//! Runs the control plane in-process against a local SQLite database. The
//! browser executor is an external collaborator; without one configured,
//! `run` uses the simulated executor, which walks every item through the
//! full dispatch path without touching a browser.
//!
//! Exit codes: 0 success, 64 config error, 65 repository unavailable,
//! 70 fatal internal error, 130 cancelled.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// jobpilot - autonomous job-application orchestrator
#[derive(Parser, Debug)]
#[command(name = "jobpilot")]
#[command(version, about, long_about = None)]
pub(crate) struct Cli {
    /// Path to the SQLite database
    #[arg(long, env = "JOBPILOT_DB", default_value = "jobpilot.db")]
    pub(crate) db: PathBuf,

    /// Path to the effort policy JSON file
    #[arg(long, env = "JOBPILOT_EFFORT_POLICY")]
    pub(crate) effort_policy: Option<PathBuf>,

    /// Path to the stealth / domain policy JSON file
    #[arg(long, env = "JOBPILOT_STEALTH")]
    pub(crate) stealth: Option<PathBuf>,

    /// Log filter (overrides JOBPILOT_LOG)
    #[arg(long, default_value = "info")]
    pub(crate) log_level: String,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Create a session and print its id
    CreateSession {
        /// User id (UUID); generated when omitted
        #[arg(long)]
        user: Option<uuid::Uuid>,
        /// Maximum attempted items
        #[arg(long, default_value_t = 25)]
        max_items: u32,
        /// Maximum duration in seconds
        #[arg(long, default_value_t = 4 * 3600)]
        max_duration: u64,
        /// Maximum concurrent workers
        #[arg(long, default_value_t = 5)]
        max_concurrency: u32,
        /// Cost budget in dollars
        #[arg(long, default_value_t = 5.0)]
        budget: f64,
        /// Session timezone: UTC or ±HH:MM
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },

    /// Enqueue job URLs into a session
    Enqueue {
        /// Session id
        session: String,
        /// Job posting URLs
        #[arg(required_unless_present = "file")]
        urls: Vec<String>,
        /// JSON file with a list of job specs
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Start a session and run it to completion
    Run {
        /// Session id
        session: String,
        /// Simulated fill seconds per item (simulated executor only)
        #[arg(long, default_value_t = 2)]
        fill_secs: u64,
    },

    /// Show session status and per-domain governor state
    Status {
        /// Session id
        session: String,
    },

    /// Print the persisted digest of a finished session
    Digest {
        /// Session id
        session: String,
    },

    /// Mark heartbeat-expired sessions failed (run at process start)
    Recover,

    /// Validate the effort policy and stealth files and exit
    CheckConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = std::env::var("JOBPILOT_LOG").unwrap_or_else(|_| cli.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: cannot start runtime: {e}");
            return ExitCode::from(70);
        }
    };

    match runtime.block_on(commands::dispatch(cli)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<jobpilot_engine::EngineError>()
                .map_or(70, jobpilot_engine::EngineError::exit_code);
            ExitCode::from(code)
        }
    }
}
