//! Command implementations.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use jobpilot_core::config::{parse_offset, SessionConfig, StealthConfig};
use jobpilot_core::effort::{EffortPolicyFile, LoadedEffortPolicy};
use jobpilot_core::model::{JobSpec, SessionId, SessionStatus};
use jobpilot_engine::executor::{FixedMatcher, SimulatedExecutorFactory};
use jobpilot_engine::notify::TracingNotifier;
use jobpilot_engine::repo::{Repository, SqliteRepository};
use jobpilot_engine::session::{ControllerParts, EngineSettings, SessionController};

use crate::{Cli, Commands};

/// Exit code for operator cancellation (SIGINT).
const EXIT_CANCELLED: u8 = 130;

pub async fn dispatch(cli: Cli) -> Result<ExitCode> {
    match &cli.command {
        Commands::CheckConfig => check_config(&cli),
        Commands::CreateSession {
            user,
            max_items,
            max_duration,
            max_concurrency,
            budget,
            timezone,
        } => {
            let config = SessionConfig {
                max_items: *max_items,
                max_duration_secs: *max_duration,
                max_concurrency: *max_concurrency,
                budget_cost: *budget,
                timezone: timezone.clone(),
                effort_policy_ref: cli
                    .effort_policy
                    .as_ref()
                    .map(|p| p.display().to_string()),
                stealth_policy_ref: cli.stealth.as_ref().map(|p| p.display().to_string()),
            };
            let controller = controller(&cli, None)?;
            let user_id = user.unwrap_or_else(uuid::Uuid::new_v4);
            let session_id = controller.create_session(user_id, &config)?;
            println!("{session_id}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Enqueue {
            session,
            urls,
            file,
        } => {
            let session_id = parse_session(session)?;
            let controller = controller(&cli, None)?;
            let jobs = if let Some(path) = file {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str::<Vec<JobSpec>>(&text)
                    .map_err(|e| config_error(format!("malformed job file: {e}")))?
            } else {
                urls.iter()
                    .map(|url| JobSpec {
                        url: url.clone(),
                        title: None,
                        company: None,
                        description: None,
                        company_tier: jobpilot_core::model::CompanyTier::Normal,
                        hint_effort: jobpilot_core::model::Effort::Medium,
                    })
                    .collect()
            };
            let ids = controller.enqueue_items(session_id, &jobs).await?;
            for id in ids {
                println!("{id}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { session, fill_secs } => {
            let session_id = parse_session(session)?;
            let controller = Arc::new(controller(
                &cli,
                Some(std::time::Duration::from_secs(*fill_secs)),
            )?);
            controller.start(session_id)?;

            let canceller = controller.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; cancelling session");
                    let _ = canceller.cancel(session_id);
                }
            });

            let status = controller.wait(session_id).await?;
            let report = controller.status(session_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(match status {
                SessionStatus::Completed => ExitCode::SUCCESS,
                SessionStatus::Cancelled => ExitCode::from(EXIT_CANCELLED),
                _ => ExitCode::from(70),
            })
        }
        Commands::Status { session } => {
            let session_id = parse_session(session)?;
            let controller = controller(&cli, None)?;
            let report = controller.status(session_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Digest { session } => {
            let session_id = parse_session(session)?;
            let repo = open_repo(&cli.db)?;
            match repo.get_digest(session_id)? {
                Some(digest) => {
                    println!("{}", serde_json::to_string_pretty(&digest)?);
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("no digest persisted for session {session_id}");
                    Ok(ExitCode::from(70))
                }
            }
        }
        Commands::Recover => {
            let controller = controller(&cli, None)?;
            let recovered = controller.recover_orphaned().await?;
            info!(recovered, "recovery pass complete");
            println!("{recovered}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn check_config(cli: &Cli) -> Result<ExitCode> {
    let policy = load_effort_policy(cli)?;
    let stealth = load_stealth(cli)?;
    println!(
        "effort policy ok (skip threshold {}), stealth ok ({} domain entries)",
        policy.skip_threshold(),
        stealth.domains.len()
    );
    Ok(ExitCode::SUCCESS)
}

fn parse_session(text: &str) -> Result<SessionId> {
    text.parse::<SessionId>()
        .map_err(|e| config_error(format!("invalid session id '{text}': {e}")))
}

fn config_error(message: String) -> anyhow::Error {
    anyhow::Error::new(jobpilot_engine::EngineError::Config(message))
}

fn open_repo(path: &Path) -> Result<SqliteRepository> {
    Ok(SqliteRepository::open(path)
        .map_err(jobpilot_engine::EngineError::Repository)?)
}

fn load_effort_policy(cli: &Cli) -> Result<LoadedEffortPolicy> {
    match &cli.effort_policy {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(EffortPolicyFile::from_json(&text)
                .map_err(|e| config_error(e.to_string()))?
                .compile()
                .map_err(|e| config_error(e.to_string()))?)
        }
        None => Ok(LoadedEffortPolicy::default()),
    }
}

fn load_stealth(cli: &Cli) -> Result<StealthConfig> {
    match &cli.stealth {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(StealthConfig::from_json(&text).map_err(|e| config_error(e.to_string()))?)
        }
        None => Ok(StealthConfig::default()),
    }
}

fn controller(
    cli: &Cli,
    fill_duration: Option<std::time::Duration>,
) -> Result<SessionController> {
    let repo = Arc::new(open_repo(&cli.db)?);
    let effort_policy = load_effort_policy(cli)?;
    let stealth = load_stealth(cli)?;
    // Day boundaries follow the operator's configured offset; sessions
    // carry their own copy in the config snapshot.
    let timezone = parse_offset(
        &std::env::var("JOBPILOT_TZ").unwrap_or_else(|_| "UTC".to_string()),
    )
    .map_err(|e| config_error(e.to_string()))?;

    Ok(SessionController::new(ControllerParts {
        repo,
        factory: Arc::new(SimulatedExecutorFactory { fill_duration }),
        matcher: Arc::new(FixedMatcher(0.75)),
        notifier: Arc::new(TracingNotifier),
        stealth,
        effort_policy,
        settings: EngineSettings::default(),
        timezone,
    })?)
}
