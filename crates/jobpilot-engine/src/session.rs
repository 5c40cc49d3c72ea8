//! Session controller.
//!
//! The composition root for one process: it owns the repository handle, the
//! shared rate governor, the intervention bridge, and the notification
//! sink, and exposes the control API the CLI (or any front-end) consumes —
//! create, enqueue, start, pause, resume, stop, cancel, status, resolve,
//! recover.
//!
//! Starting a session spawns its dispatcher and worker pool; the spawned
//! task runs the session to its end, persists the terminal status and the
//! digest, emits the terminal event, and pushes the digest notification.
//! The controller never resumes sessions across process restarts on its
//! own: [`SessionController::recover_orphaned`] marks heartbeat-expired
//! sessions failed, and resuming is an operator action.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::FixedOffset;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use jobpilot_core::config::{ConfigError, SessionConfig, StealthConfig};
use jobpilot_core::digest::{build_digest, SessionDigest};
use jobpilot_core::effort::{LoadedEffortPolicy, PolicyError};
use jobpilot_core::governor::{DomainSnapshot, RateGovernor};
use jobpilot_core::model::{
    reasons, Application, ApplicationId, ApplicationStatus, EventType, JobSpec, Session,
    SessionCounters, SessionId, SessionStatus, StateError,
};

use crate::clock::EngineClock;
use crate::dispatcher::{ControlCommand, Dispatcher, DispatcherParts, SessionEnd};
use crate::event_log::{EventLog, EventLogError};
use crate::executor::{ExecutorFactory, Matcher};
use crate::intervention::{InterventionBridge, Resolution, ResolveOutcome};
use crate::notify::{Notifier, NotifyKind};
use crate::repo::{Repository, RepositoryError};
use crate::worker::{WorkerContext, WorkerPool};

/// Engine-level timing and sizing settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Worker pool size; the effective size is capped by each session's
    /// `max_concurrency`.
    pub worker_count: usize,
    /// Dispatcher housekeeping tick.
    pub tick_interval: Duration,
    /// Hard per-item duration limit.
    pub max_item_duration: Duration,
    /// Grace window for cooperative shutdown and timeout release.
    pub shutdown_window: Duration,
    /// Deadline for human intervention resolutions.
    pub intervention_timeout: Duration,
    /// Consecutive failures after which a worker is replaced.
    pub max_consecutive_failures: u32,
    /// How often the session heartbeat is refreshed.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a session counts as orphaned.
    pub heartbeat_expiry: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker_count: 5,
            tick_interval: Duration::from_millis(100),
            max_item_duration: Duration::from_secs(10 * 60),
            shutdown_window: Duration::from_secs(30),
            intervention_timeout: Duration::from_secs(5 * 60),
            max_consecutive_failures: 3,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_expiry: Duration::from_secs(60),
        }
    }
}

/// Engine errors, mapped to CLI exit codes by [`EngineError::exit_code`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// The repository is unavailable or refused the operation.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The event log gave up.
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    /// A lifecycle call does not fit the session's current status.
    #[error(transparent)]
    State(#[from] StateError),

    /// The session is not known to this controller.
    #[error("session '{0}' is not active in this process")]
    NotActive(SessionId),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<PolicyError> for EngineError {
    fn from(e: PolicyError) -> Self {
        Self::Config(e.to_string())
    }
}

impl EngineError {
    /// The CLI exit code for this error: 64 config, 65 repository,
    /// 70 internal.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 64,
            Self::Repository(_) => 65,
            Self::EventLog(_) | Self::State(_) | Self::NotActive(_) | Self::Internal(_) => 70,
        }
    }
}

/// Point-in-time session status for the control API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    /// The session.
    pub session_id: SessionId,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Current counters.
    pub counters: SessionCounters,
    /// Items currently held by workers.
    pub in_flight: u32,
    /// Per-domain governor state.
    pub domain_summary: std::collections::BTreeMap<String, DomainSnapshot>,
}

struct ActiveSession {
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    join: Option<JoinHandle<SessionStatus>>,
}

/// Everything the controller needs at construction.
pub struct ControllerParts {
    /// Repository handle.
    pub repo: Arc<dyn Repository>,
    /// Per-worker executor factory.
    pub factory: Arc<dyn ExecutorFactory>,
    /// Semantic matcher.
    pub matcher: Arc<dyn Matcher>,
    /// Notification sink.
    pub notifier: Arc<dyn Notifier>,
    /// Stealth / domain policy file contents.
    pub stealth: StealthConfig,
    /// Compiled effort policy.
    pub effort_policy: LoadedEffortPolicy,
    /// Engine settings.
    pub settings: EngineSettings,
    /// Timezone for governor day boundaries; normally the same offset the
    /// process's sessions are configured with.
    pub timezone: FixedOffset,
}

/// The process-scoped session controller.
pub struct SessionController {
    repo: Arc<dyn Repository>,
    event_log: EventLog,
    governor: Arc<RateGovernor>,
    policy: Arc<LoadedEffortPolicy>,
    bridge: Arc<InterventionBridge>,
    notifier: Arc<dyn Notifier>,
    factory: Arc<dyn ExecutorFactory>,
    matcher: Arc<dyn Matcher>,
    clock: EngineClock,
    settings: EngineSettings,
    active: Mutex<HashMap<SessionId, ActiveSession>>,
}

impl SessionController {
    /// Builds the controller, merging persisted domain policies over the
    /// stealth file.
    ///
    /// # Errors
    ///
    /// Returns a repository error when persisted policies cannot be read.
    pub fn new(parts: ControllerParts) -> Result<Self, EngineError> {
        let clock = EngineClock::new();
        let mut policies = parts.stealth.domains.clone();
        // Rows persisted by earlier runs override the file: they carry
        // cooldowns and operator upserts.
        for (domain, policy) in parts.repo.load_domain_policies()? {
            policies.insert(domain, policy);
        }
        let governor = Arc::new(RateGovernor::new(
            parts.timezone,
            parts.stealth.default.clone(),
            policies,
        ));
        let event_log = EventLog::new(parts.repo.clone(), clock.clone());
        let bridge = Arc::new(InterventionBridge::new(parts.notifier.clone()));
        Ok(Self {
            repo: parts.repo,
            event_log,
            governor,
            policy: Arc::new(parts.effort_policy),
            bridge,
            notifier: parts.notifier,
            factory: parts.factory,
            matcher: parts.matcher,
            clock,
            settings: parts.settings,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// The shared intervention bridge, for external resolution endpoints.
    #[must_use]
    pub fn bridge(&self) -> Arc<InterventionBridge> {
        self.bridge.clone()
    }

    /// Creates a session in `planned` status with a frozen config snapshot.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` for an invalid timezone, or a
    /// repository error.
    pub fn create_session(
        &self,
        user_id: Uuid,
        config: &SessionConfig,
    ) -> Result<SessionId, EngineError> {
        config.tz_offset()?;
        let session = Session {
            id: SessionId::new(),
            user_id,
            status: SessionStatus::Planned,
            limits: config.limits(),
            counters: SessionCounters::default(),
            config_snapshot: serde_json::to_value(config)
                .map_err(|e| EngineError::Internal(e.to_string()))?,
            timezone: config.timezone.clone(),
            created_at: self.clock.now(),
            started_at: None,
            ended_at: None,
            heartbeat_at: None,
        };
        self.repo.create_session(&session)?;
        self.event_log.open_session(session.id)?;
        info!(session_id = %session.id, "session created");
        Ok(session.id)
    }

    /// Enqueues candidate jobs, scoring each through the matcher.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is terminal or a job URL has no
    /// domain; successfully created items are kept either way.
    pub async fn enqueue_items(
        &self,
        session_id: SessionId,
        jobs: &[JobSpec],
    ) -> Result<Vec<ApplicationId>, EngineError> {
        let session = self.repo.get_session(session_id)?;
        if session.status.is_terminal() {
            return Err(EngineError::State(StateError::IllegalTransition {
                entity: "session",
                from: session.status.as_str().to_string(),
                to: "enqueue".to_string(),
            }));
        }
        let mut next_seq = self
            .repo
            .list_applications(session_id)?
            .last()
            .map_or(0, |a| a.enqueue_seq)
            + 1;

        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let score = self.matcher.score(job).await;
            let application = Application::from_spec(
                session_id,
                session.user_id,
                job,
                score,
                next_seq,
                self.clock.now(),
            )?;
            next_seq += 1;
            self.repo.create_application(&application)?;
            self.event_log
                .append(
                    session_id,
                    Some(application.id),
                    EventType::ItemQueued,
                    None,
                    json!({
                        "domain": application.domain,
                        "match_score": application.match_score,
                    }),
                )
                .await?;
            ids.push(application.id);
        }
        info!(session_id = %session_id, count = ids.len(), "items enqueued");
        Ok(ids)
    }

    /// Starts a planned session: spawns its worker pool and dispatcher.
    ///
    /// # Errors
    ///
    /// Returns a state error unless the session is `planned`.
    pub fn start(&self, session_id: SessionId) -> Result<(), EngineError> {
        let mut session = self.repo.get_session(session_id)?;
        if session.status != SessionStatus::Planned {
            return Err(EngineError::State(StateError::IllegalTransition {
                entity: "session",
                from: session.status.as_str().to_string(),
                to: SessionStatus::Running.as_str().to_string(),
            }));
        }
        self.repo
            .update_session_status(session_id, SessionStatus::Running)?;
        let now = self.clock.now();
        self.repo.set_session_started(session_id, now)?;
        self.repo.touch_heartbeat(session_id, now)?;
        session.status = SessionStatus::Running;
        session.started_at = Some(now);
        self.event_log.open_session(session_id)?;

        let worker_count = self
            .settings
            .worker_count
            .min(session.limits.max_concurrency as usize)
            .max(1);
        let ctx = WorkerContext {
            repo: self.repo.clone(),
            event_log: self.event_log.clone(),
            bridge: self.bridge.clone(),
            clock: self.clock.clone(),
            intervention_timeout: self.settings.intervention_timeout,
            max_consecutive_failures: self.settings.max_consecutive_failures,
        };
        let (pool, report_rx) = WorkerPool::new(ctx, self.factory.clone(), worker_count);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::new(DispatcherParts {
            session: session.clone(),
            repo: self.repo.clone(),
            event_log: self.event_log.clone(),
            governor: self.governor.clone(),
            policy: self.policy.clone(),
            clock: self.clock.clone(),
            pool,
            report_rx,
            control_rx,
            settings: self.settings.clone(),
        });

        let finalizer = Finalizer {
            repo: self.repo.clone(),
            event_log: self.event_log.clone(),
            notifier: self.notifier.clone(),
            clock: self.clock.clone(),
        };
        let join = tokio::spawn(async move {
            let end = dispatcher.run().await;
            finalizer.finalize(session_id, end).await
        });

        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                session_id,
                ActiveSession {
                    control_tx,
                    join: Some(join),
                },
            );
        info!(session_id = %session_id, workers = worker_count, "session started");
        Ok(())
    }

    fn send_control(
        &self,
        session_id: SessionId,
        command: ControlCommand,
    ) -> Result<(), EngineError> {
        let active = self
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = active
            .get(&session_id)
            .ok_or(EngineError::NotActive(session_id))?;
        entry
            .control_tx
            .send(command)
            .map_err(|_| EngineError::NotActive(session_id))
    }

    /// Suspends dispatch; in-flight items complete.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotActive` when the session is not running in
    /// this process.
    pub fn pause(&self, session_id: SessionId) -> Result<(), EngineError> {
        self.send_control(session_id, ControlCommand::Pause)
    }

    /// Resumes dispatch after a pause.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotActive` when the session is not running in
    /// this process.
    pub fn resume(&self, session_id: SessionId) -> Result<(), EngineError> {
        self.send_control(session_id, ControlCommand::Resume)
    }

    /// Graceful drain: no new items, in-flight items finish, then
    /// `completed`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotActive` when the session is not running in
    /// this process.
    pub fn stop(&self, session_id: SessionId) -> Result<(), EngineError> {
        self.send_control(session_id, ControlCommand::Stop)
    }

    /// Cooperative cancellation: workers stop at their next suspension
    /// point, items become `cancelled`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotActive` when the session is not running in
    /// this process.
    pub fn cancel(&self, session_id: SessionId) -> Result<(), EngineError> {
        self.send_control(session_id, ControlCommand::Cancel)
    }

    /// Awaits a started session's terminal status.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotActive` if the session was never started
    /// here or is already being awaited.
    pub async fn wait(&self, session_id: SessionId) -> Result<SessionStatus, EngineError> {
        let join = {
            let mut active = self
                .active
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            active
                .get_mut(&session_id)
                .and_then(|entry| entry.join.take())
                .ok_or(EngineError::NotActive(session_id))?
        };
        let status = join
            .await
            .map_err(|e| EngineError::Internal(format!("session task panicked: {e}")))?;
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&session_id);
        Ok(status)
    }

    /// Current status, counters, and per-domain governor state.
    ///
    /// # Errors
    ///
    /// Returns a repository error when the session cannot be read.
    pub fn status(&self, session_id: SessionId) -> Result<StatusReport, EngineError> {
        let session = self.repo.get_session(session_id)?;
        Ok(StatusReport {
            session_id,
            status: session.status,
            counters: session.counters,
            in_flight: session.counters.in_flight,
            domain_summary: self.governor.snapshot(),
        })
    }

    /// Posts a human resolution for a pending intervention.
    ///
    /// Idempotent: duplicate resolutions are ignored and reported as such.
    #[must_use]
    pub fn resolve_intervention(
        &self,
        application_id: ApplicationId,
        resolution: Resolution,
    ) -> ResolveOutcome {
        self.bridge.resolve(application_id, resolution)
    }

    /// Marks heartbeat-expired sessions (and their in-flight items) failed.
    /// Returns the number of sessions recovered. Run once at process start,
    /// before any dispatch.
    ///
    /// # Errors
    ///
    /// Returns a repository error when the scan fails.
    pub async fn recover_orphaned(&self) -> Result<u32, EngineError> {
        let now = self.clock.now();
        let expiry = now
            - chrono::Duration::from_std(self.settings.heartbeat_expiry)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let stale = self.repo.list_stale_sessions(expiry)?;
        let mut recovered = 0;
        for session in stale {
            warn!(session_id = %session.id, "recovering orphaned session");
            self.event_log.open_session(session.id)?;

            for item in self.repo.list_in_progress(session.id)? {
                let result = self
                    .event_log
                    .transition(
                        &item,
                        ApplicationStatus::Failed,
                        Some((reasons::ORPHANED, "process died while item in flight")),
                        EventType::ItemFailed,
                        None,
                        json!({
                            "reason": reasons::ORPHANED,
                            "tokens_in": 0,
                            "tokens_out": 0,
                            "cost_micros": 0,
                        }),
                    )
                    .await;
                if let Err(err) = result {
                    warn!(application_id = %item.id, %err, "orphaned item not recoverable");
                }
                self.repo.add_session_counters(
                    session.id,
                    &jobpilot_core::model::CounterDelta {
                        failed: 1,
                        in_flight: -1,
                        ..jobpilot_core::model::CounterDelta::default()
                    },
                )?;
            }

            let to_failing = match session.status {
                SessionStatus::Cancelling => None,
                _ => Some(SessionStatus::Failing),
            };
            if let Some(step) = to_failing {
                if let Err(err) = self.repo.update_session_status(session.id, step) {
                    warn!(session_id = %session.id, %err, "could not step to failing");
                }
                self.repo
                    .mark_session_terminal(session.id, SessionStatus::Failed, now)?;
            } else {
                self.repo
                    .mark_session_terminal(session.id, SessionStatus::Cancelled, now)?;
            }
            let _ = self
                .event_log
                .append(
                    session.id,
                    None,
                    EventType::SessionFailed,
                    Some(reasons::PROCESS_DIED.to_string()),
                    json!({ "reason": reasons::PROCESS_DIED }),
                )
                .await;
            self.event_log.close_session(session.id);
            recovered += 1;
        }
        Ok(recovered)
    }
}

/// Terminal bookkeeping, run by the spawned session task after the
/// dispatcher returns.
struct Finalizer {
    repo: Arc<dyn Repository>,
    event_log: EventLog,
    notifier: Arc<dyn Notifier>,
    clock: EngineClock,
}

impl Finalizer {
    async fn finalize(&self, session_id: SessionId, end: SessionEnd) -> SessionStatus {
        let now = self.clock.now();
        let (step, terminal, event_type) = match &end {
            SessionEnd::Completed => (
                SessionStatus::Draining,
                SessionStatus::Completed,
                EventType::SessionCompleted,
            ),
            SessionEnd::Cancelled => (
                SessionStatus::Cancelling,
                SessionStatus::Cancelled,
                EventType::SessionCancelled,
            ),
            SessionEnd::Failed { .. } => (
                SessionStatus::Failing,
                SessionStatus::Failed,
                EventType::SessionFailed,
            ),
        };

        // The dispatcher usually stepped into the teardown status already;
        // if the loop ended straight from running (queue drained), step now.
        if let Err(err) = self.repo.update_session_status(session_id, step) {
            if !matches!(err, RepositoryError::IllegalTransition(_)) {
                error!(session_id = %session_id, %err, "teardown status update failed");
            }
        }
        if let Err(err) = self.repo.mark_session_terminal(session_id, terminal, now) {
            error!(session_id = %session_id, %err, "terminal status update failed");
        }

        let digest = self.build_and_store_digest(session_id).await;

        let payload = match (&end, &digest) {
            (SessionEnd::Failed { reason, message }, _) => {
                json!({ "reason": reason, "message": message })
            }
            (_, Some(digest)) => json!({ "counters": digest.counters }),
            _ => json!({}),
        };
        if let Err(err) = self
            .event_log
            .append(session_id, None, event_type, None, payload)
            .await
        {
            error!(session_id = %session_id, %err, "terminal event append failed");
        }

        if let SessionEnd::Failed { reason, message } = &end {
            self.notifier.notify(
                NotifyKind::FatalError,
                &json!({
                    "session_id": session_id.to_string(),
                    "reason": reason,
                    "message": message,
                }),
            );
        }
        if let Some(digest) = &digest {
            match serde_json::to_value(digest) {
                Ok(value) => self.notifier.notify(NotifyKind::SessionDigest, &value),
                Err(err) => error!(%err, "digest serialization failed"),
            }
        }
        self.event_log.close_session(session_id);
        info!(session_id = %session_id, status = terminal.as_str(), "session finished");
        terminal
    }

    async fn build_and_store_digest(&self, session_id: SessionId) -> Option<SessionDigest> {
        let session = match self.repo.get_session(session_id) {
            Ok(session) => session,
            Err(err) => {
                error!(session_id = %session_id, %err, "cannot load session for digest");
                return None;
            }
        };
        let applications = match self.repo.list_applications(session_id) {
            Ok(applications) => applications,
            Err(err) => {
                error!(session_id = %session_id, %err, "cannot load applications for digest");
                return None;
            }
        };
        let digest = build_digest(&session, &applications);
        if let Err(err) = self.repo.upsert_digest(&digest) {
            error!(session_id = %session_id, %err, "digest upsert failed");
        }
        Some(digest)
    }
}
