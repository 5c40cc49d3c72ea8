//! Worker pool.
//!
//! A fixed-size set of worker tasks, each a single sequential consumer with
//! its own executor instance. Work arrives on a bounded per-worker channel;
//! every finished item is reported on one shared results channel that the
//! dispatcher drains.
//!
//! Failure containment: each item executes inside a nested task, so an
//! executor panic surfaces as a `JoinError` in the worker frame. The worker
//! records `worker_crashed`, fails the item with `worker_exception`, and
//! keeps serving. A worker whose failures exceed the consecutive-failure
//! bound asks to be decommissioned; the pool replaces it with a fresh task
//! and a fresh executor. Executor state is never shared between workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jobpilot_core::effort::Decision;
use jobpilot_core::model::{
    reasons, Application, ApplicationId, ApplicationStatus, EventType,
};

use crate::clock::EngineClock;
use crate::event_log::{EventLog, EventLogError};
use crate::executor::{
    ApplicationExecutor, ExecutorError, ExecutorFactory, InterventionKind, RunOutcome,
    SubmissionReport,
};
use crate::intervention::{InterventionAction, InterventionBridge};
use crate::repo::Repository;

/// Why a worker was told to stop what it is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Not cancelled.
    #[default]
    None,
    /// The session is cancelling; items become `cancelled`.
    Session,
    /// This item exceeded its hard duration limit; it becomes `failed`.
    ItemTimeout,
}

/// One unit of work handed to a worker.
#[derive(Debug)]
pub struct Assignment {
    /// The application to run; status `queued`.
    pub application: Application,
    /// The policy decision for the item.
    pub decision: Decision,
    /// Stealth delay to sleep before starting.
    pub start_delay: Duration,
    /// Cancellation signal; checked at every suspension point.
    pub cancel: watch::Receiver<CancelReason>,
}

/// Terminal outcome of one item, as reported to the dispatcher.
#[derive(Debug)]
pub enum ItemOutcome {
    /// Submitted; token/cost totals for budget settlement.
    Submitted {
        /// Input tokens consumed.
        tokens_in: u64,
        /// Output tokens consumed.
        tokens_out: u64,
        /// Estimated cost in micro-dollars.
        cost_micros: u64,
    },
    /// Failed with a stable reason code.
    Failed {
        /// Reason code.
        reason: String,
        /// Whether the domain actively blocked us (governor cooldown).
        domain_blocked: bool,
        /// Cost incurred before the failure.
        cost_micros: u64,
        /// Tokens consumed before the failure.
        tokens_in: u64,
        /// Tokens produced before the failure.
        tokens_out: u64,
    },
    /// Skipped after dispatch (human resolved `skip`).
    Skipped {
        /// Reason code.
        reason: String,
    },
    /// Cancelled with the session.
    Cancelled,
    /// The event log is unwritable; the session must fail.
    LogFailure {
        /// Description of the final write error.
        message: String,
    },
}

/// Report sent to the dispatcher after each item.
#[derive(Debug)]
pub struct WorkerReport {
    /// Reporting worker.
    pub worker_id: usize,
    /// The finished item.
    pub application_id: ApplicationId,
    /// The item's domain, for governor release.
    pub domain: String,
    /// What happened.
    pub outcome: ItemOutcome,
    /// The worker wants to be replaced (failure streak or resource
    /// exhaustion).
    pub decommission: bool,
}

/// Shared dependencies each worker needs.
#[derive(Clone)]
pub struct WorkerContext {
    /// Repository handle.
    pub repo: Arc<dyn Repository>,
    /// Event log.
    pub event_log: EventLog,
    /// Intervention bridge.
    pub bridge: Arc<InterventionBridge>,
    /// Engine clock.
    pub clock: EngineClock,
    /// Deadline for human intervention resolutions.
    pub intervention_timeout: Duration,
    /// Consecutive failures after which a worker decommissions itself.
    pub max_consecutive_failures: u32,
}

/// Handle to one live worker task.
#[derive(Debug)]
struct WorkerHandle {
    work_tx: mpsc::Sender<Assignment>,
    join: JoinHandle<()>,
}

/// The pool: spawns, replaces, and tears down workers.
pub struct WorkerPool {
    ctx: WorkerContext,
    factory: Arc<dyn ExecutorFactory>,
    report_tx: mpsc::Sender<WorkerReport>,
    workers: HashMap<usize, WorkerHandle>,
    next_id: usize,
}

impl WorkerPool {
    /// Creates a pool of `size` workers and returns it with the report
    /// channel's receiving end.
    #[must_use]
    pub fn new(
        ctx: WorkerContext,
        factory: Arc<dyn ExecutorFactory>,
        size: usize,
    ) -> (Self, mpsc::Receiver<WorkerReport>) {
        let (report_tx, report_rx) = mpsc::channel(size.max(1) * 2);
        let mut pool = Self {
            ctx,
            factory,
            report_tx,
            workers: HashMap::new(),
            next_id: 0,
        };
        for _ in 0..size {
            pool.spawn_worker();
        }
        (pool, report_rx)
    }

    fn spawn_worker(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        let (work_tx, work_rx) = mpsc::channel(1);
        let worker = Worker {
            id,
            executor: self.factory.create(id),
            ctx: self.ctx.clone(),
            work_rx,
            report_tx: self.report_tx.clone(),
            consecutive_failures: 0,
        };
        let join = tokio::spawn(worker.run());
        self.workers.insert(id, WorkerHandle { work_tx, join });
        debug!(worker_id = id, "worker spawned");
        id
    }

    /// Worker ids currently alive.
    #[must_use]
    pub fn worker_ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.workers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Hands an assignment to a specific worker. Non-blocking; returns the
    /// assignment back if the worker's channel is full or closed.
    ///
    /// # Errors
    ///
    /// Returns the assignment on failure so the dispatcher can requeue it.
    pub fn assign(&self, worker_id: usize, assignment: Assignment) -> Result<(), Assignment> {
        let Some(handle) = self.workers.get(&worker_id) else {
            return Err(assignment);
        };
        handle.work_tx.try_send(assignment).map_err(|e| match e {
            mpsc::error::TrySendError::Full(a) | mpsc::error::TrySendError::Closed(a) => a,
        })
    }

    /// Replaces a worker: the old task is aborted, a fresh one (with a
    /// fresh executor) is spawned. Returns the new worker id.
    pub fn replace(&mut self, worker_id: usize) -> usize {
        if let Some(handle) = self.workers.remove(&worker_id) {
            handle.join.abort();
            info!(worker_id, "worker decommissioned");
        }
        self.spawn_worker()
    }

    /// Drops work channels and waits for every worker to drain and exit.
    pub async fn shutdown(&mut self) {
        let handles: Vec<WorkerHandle> = self.workers.drain().map(|(_, h)| h).collect();
        for WorkerHandle { work_tx, join } in handles {
            // Closing the channel ends the worker's receive loop.
            drop(work_tx);
            let _ = join.await;
        }
    }
}

struct Worker {
    id: usize,
    executor: Arc<dyn ApplicationExecutor>,
    ctx: WorkerContext,
    work_rx: mpsc::Receiver<Assignment>,
    report_tx: mpsc::Sender<WorkerReport>,
    consecutive_failures: u32,
}

impl Worker {
    async fn run(mut self) {
        while let Some(assignment) = self.work_rx.recv().await {
            let report = self.process(assignment).await;
            let decommission = report.decommission;
            if self.report_tx.send(report).await.is_err() {
                break;
            }
            if decommission {
                break;
            }
        }
        debug!(worker_id = self.id, "worker loop ended");
    }

    #[allow(clippy::too_many_lines)]
    async fn process(&mut self, assignment: Assignment) -> WorkerReport {
        let Assignment {
            mut application,
            decision,
            start_delay,
            mut cancel,
        } = assignment;
        let effort = decision.effort;
        let domain = application.domain.clone();

        // Stealth jitter, cancellation-aware.
        if !start_delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(start_delay) => {}
                reason = wait_cancel(&mut cancel) => {
                    return self.finish_interrupted(&application, &domain, reason).await;
                }
            }
        }
        if *cancel.borrow() != CancelReason::None {
            let reason = *cancel.borrow();
            return self.finish_interrupted(&application, &domain, reason).await;
        }

        // queued -> in_progress, write-ahead.
        let started = self
            .ctx
            .event_log
            .transition(
                &application,
                ApplicationStatus::InProgress,
                None,
                EventType::ItemStarted,
                None,
                json!({ "worker_id": self.id, "effort": effort.as_str() }),
            )
            .await;
        if let Err(err) = started {
            return self.log_failure(&application, &domain, &err);
        }
        application.status = ApplicationStatus::InProgress;
        let now = self.ctx.clock.now();
        if let Err(err) = self
            .ctx
            .repo
            .set_application_timing(application.id, Some(now), None)
        {
            warn!(application_id = %application.id, %err, "failed to stamp started_at");
        }

        let mut attempt: u32 = 0;
        loop {
            let executor = Arc::clone(&self.executor);
            let run_app = application.clone();
            let mut join =
                tokio::spawn(async move { executor.run(&run_app, effort, attempt).await });

            let run_result = tokio::select! {
                res = &mut join => Some(res),
                reason = wait_cancel(&mut cancel) => {
                    join.abort();
                    let _ = (&mut join).await;
                    return self.finish_interrupted(&application, &domain, reason).await;
                }
            };

            match run_result {
                // Panic inside the executor: contain, fail the item, live on.
                Some(Err(join_err)) => {
                    error!(
                        worker_id = self.id,
                        application_id = %application.id,
                        "executor panicked: {join_err}"
                    );
                    let _ = self
                        .ctx
                        .event_log
                        .append(
                            application.session_id,
                            Some(application.id),
                            EventType::WorkerCrashed,
                            Some(format!("worker {} caught executor panic", self.id)),
                            json!({ "worker_id": self.id }),
                        )
                        .await;
                    self.consecutive_failures += 1;
                    return self
                        .finish_failed(
                            &application,
                            &domain,
                            reasons::WORKER_EXCEPTION,
                            &join_err.to_string(),
                            false,
                            &[],
                        )
                        .await;
                }
                Some(Ok(Err(exec_err))) => {
                    self.consecutive_failures += 1;
                    let exhausted = matches!(exec_err, ExecutorError::ResourceExhausted(_));
                    if exhausted {
                        self.consecutive_failures = self.ctx.max_consecutive_failures;
                    }
                    return self
                        .finish_failed(
                            &application,
                            &domain,
                            reasons::EXECUTOR_ERROR,
                            &exec_err.to_string(),
                            false,
                            &[],
                        )
                        .await;
                }
                Some(Ok(Ok(RunOutcome::Submitted(report)))) => {
                    self.consecutive_failures = 0;
                    return self.finish_submitted(&application, &domain, &report).await;
                }
                Some(Ok(Ok(RunOutcome::Failed {
                    reason,
                    detail,
                    domain_blocked,
                    usage,
                }))) => {
                    self.consecutive_failures += 1;
                    return self
                        .finish_failed(
                            &application,
                            &domain,
                            &reason,
                            &detail,
                            domain_blocked,
                            &usage,
                        )
                        .await;
                }
                Some(Ok(Ok(RunOutcome::NeedsIntervention { kind, payload }))) => {
                    match self
                        .intervene(&mut application, &mut cancel, kind, payload)
                        .await
                    {
                        InterventionStep::Resume => {
                            attempt += 1;
                            continue;
                        }
                        InterventionStep::Done(report) => return report,
                    }
                }
                None => unreachable!("cancellation returns directly"),
            }
        }
    }

    /// Runs the intervention round-trip while the item is `paused`.
    async fn intervene(
        &mut self,
        application: &mut Application,
        cancel: &mut watch::Receiver<CancelReason>,
        kind: InterventionKind,
        payload: serde_json::Value,
    ) -> InterventionStep {
        let domain = application.domain.clone();

        // The detection event precedes the pause.
        let detection = match kind {
            InterventionKind::Captcha => Some(EventType::CaptchaFailed),
            InterventionKind::TwoFactor => Some(EventType::TwoFactorRequested),
            InterventionKind::Suspicious => None,
        };
        if let Some(event_type) = detection {
            let _ = self
                .ctx
                .event_log
                .append(
                    application.session_id,
                    Some(application.id),
                    event_type,
                    None,
                    json!({ "kind": kind.as_str() }),
                )
                .await;
        }

        // in_progress -> paused, atomic with intervention_requested.
        let paused = self
            .ctx
            .event_log
            .transition(
                application,
                ApplicationStatus::Paused,
                None,
                EventType::InterventionRequested,
                None,
                json!({ "kind": kind.as_str(), "payload": payload.clone() }),
            )
            .await;
        if let Err(err) = paused {
            return InterventionStep::Done(self.log_failure(application, &domain, &err));
        }
        application.status = ApplicationStatus::Paused;

        // Clones keep the request future free of `self` borrows so the
        // cancellation arm stays usable afterwards.
        let bridge = Arc::clone(&self.ctx.bridge);
        let deadline = self.ctx.intervention_timeout;
        let application_id = application.id;
        let waited = tokio::select! {
            resolution = bridge.request(kind, application_id, payload, deadline) => {
                Ok(resolution)
            }
            reason = wait_cancel(cancel) => Err(reason),
        };
        let resolution = match waited {
            Ok(resolution) => resolution,
            Err(reason) => {
                return InterventionStep::Done(
                    self.finish_interrupted(application, &domain, reason).await,
                );
            }
        };

        match resolution.action {
            InterventionAction::Continue => {
                let solved = match kind {
                    InterventionKind::Captcha => Some(EventType::CaptchaSolved),
                    InterventionKind::TwoFactor => Some(EventType::TwoFactorSupplied),
                    InterventionKind::Suspicious => None,
                };
                if let Some(event_type) = solved {
                    let _ = self
                        .ctx
                        .event_log
                        .append(
                            application.session_id,
                            Some(application.id),
                            event_type,
                            None,
                            json!({}),
                        )
                        .await;
                }
                let resumed = self
                    .ctx
                    .event_log
                    .transition(
                        application,
                        ApplicationStatus::InProgress,
                        None,
                        EventType::InterventionResolved,
                        None,
                        json!({ "action": "continue" }),
                    )
                    .await;
                match resumed {
                    Ok(_) => {
                        application.status = ApplicationStatus::InProgress;
                        InterventionStep::Resume
                    }
                    Err(err) => {
                        InterventionStep::Done(self.log_failure(application, &domain, &err))
                    }
                }
            }
            InterventionAction::Skip if resolution.reason == reasons::INTERVENTION_TIMEOUT => {
                // Deadline expired: intervention_timeout, then the terminal
                // failure.
                let _ = self
                    .ctx
                    .event_log
                    .append(
                        application.session_id,
                        Some(application.id),
                        EventType::InterventionTimeout,
                        None,
                        json!({ "kind": kind.as_str() }),
                    )
                    .await;
                InterventionStep::Done(
                    self.finish_failed(
                        application,
                        &domain,
                        reasons::INTERVENTION_TIMEOUT,
                        "no resolution before deadline",
                        false,
                        &[],
                    )
                    .await,
                )
            }
            InterventionAction::Skip => {
                let _ = self
                    .ctx
                    .event_log
                    .append(
                        application.session_id,
                        Some(application.id),
                        EventType::InterventionResolved,
                        None,
                        json!({ "action": "skip" }),
                    )
                    .await;
                let result = self
                    .ctx
                    .event_log
                    .transition(
                        application,
                        ApplicationStatus::Skipped,
                        Some((reasons::INTERVENTION_SKIP, &resolution.reason)),
                        EventType::ItemSkipped,
                        None,
                        json!({ "reason": reasons::INTERVENTION_SKIP }),
                    )
                    .await;
                InterventionStep::Done(match result {
                    Ok(_) => self.report(
                        application,
                        &domain,
                        ItemOutcome::Skipped {
                            reason: reasons::INTERVENTION_SKIP.to_string(),
                        },
                    ),
                    Err(err) => self.log_failure(application, &domain, &err),
                })
            }
            InterventionAction::Abort => {
                let _ = self
                    .ctx
                    .event_log
                    .append(
                        application.session_id,
                        Some(application.id),
                        EventType::InterventionResolved,
                        None,
                        json!({ "action": "abort" }),
                    )
                    .await;
                InterventionStep::Done(
                    self.finish_failed(
                        application,
                        &domain,
                        reasons::INTERVENTION_ABORT,
                        "aborted by operator",
                        false,
                        &[],
                    )
                    .await,
                )
            }
        }
    }

    async fn finish_submitted(
        &mut self,
        application: &Application,
        domain: &str,
        report: &SubmissionReport,
    ) -> WorkerReport {
        let now = self.ctx.clock.now();
        for answered in &report.questions {
            if let Err(err) = self.ctx.repo.append_question(
                application.id,
                &answered.field,
                &answered.value,
                answered.source,
                answered.confidence,
                answered.validation_error.as_deref(),
                now,
            ) {
                warn!(application_id = %application.id, %err, "failed to record question");
            }
        }
        self.record_usage(application, &report.usage);
        let (tokens_in, tokens_out, cost_micros) = report.totals();
        if let Err(err) = self
            .ctx
            .repo
            .set_application_timing(application.id, None, Some(now))
        {
            warn!(application_id = %application.id, %err, "failed to stamp submitted_at");
        }

        let result = self
            .ctx
            .event_log
            .transition(
                application,
                ApplicationStatus::Submitted,
                None,
                EventType::ItemSubmitted,
                report.confirmation.clone(),
                json!({
                    "tokens_in": tokens_in,
                    "tokens_out": tokens_out,
                    "cost_micros": cost_micros,
                }),
            )
            .await;
        match result {
            Ok(_) => self.report(
                application,
                domain,
                ItemOutcome::Submitted {
                    tokens_in,
                    tokens_out,
                    cost_micros,
                },
            ),
            Err(err) => self.log_failure(application, domain, &err),
        }
    }

    async fn finish_failed(
        &mut self,
        application: &Application,
        domain: &str,
        reason: &str,
        detail: &str,
        domain_blocked: bool,
        usage: &[crate::executor::UsageSample],
    ) -> WorkerReport {
        self.record_usage(application, usage);
        let (tokens_in, tokens_out, cost_micros) = usage.iter().fold((0, 0, 0), |(i, o, c), u| {
            (i + u.tokens_in, o + u.tokens_out, c + u.cost_micros)
        });
        let result = self
            .ctx
            .event_log
            .transition(
                application,
                ApplicationStatus::Failed,
                Some((reason, detail)),
                EventType::ItemFailed,
                Some(detail.to_string()),
                json!({
                    "reason": reason,
                    "tokens_in": tokens_in,
                    "tokens_out": tokens_out,
                    "cost_micros": cost_micros,
                }),
            )
            .await;
        match result {
            Ok(_) => self.report(
                application,
                domain,
                ItemOutcome::Failed {
                    reason: reason.to_string(),
                    domain_blocked,
                    cost_micros,
                    tokens_in,
                    tokens_out,
                },
            ),
            Err(err) => self.log_failure(application, domain, &err),
        }
    }

    /// Terminal path for cancellation and hard timeout.
    async fn finish_interrupted(
        &mut self,
        application: &Application,
        domain: &str,
        reason: CancelReason,
    ) -> WorkerReport {
        match reason {
            CancelReason::ItemTimeout => {
                self.finish_failed(
                    application,
                    domain,
                    reasons::TIMEOUT,
                    "exceeded max item duration",
                    false,
                    &[],
                )
                .await
            }
            CancelReason::Session | CancelReason::None => {
                self.finish_cancelled(application, domain, reason).await
            }
        }
    }

    async fn finish_cancelled(
        &mut self,
        application: &Application,
        domain: &str,
        _reason: CancelReason,
    ) -> WorkerReport {
        let result = self
            .ctx
            .event_log
            .transition(
                application,
                ApplicationStatus::Cancelled,
                Some((reasons::SESSION_CANCELLED, "session cancelled")),
                EventType::ItemCancelled,
                None,
                json!({ "reason": reasons::SESSION_CANCELLED }),
            )
            .await;
        match result {
            Ok(_) => self.report(application, domain, ItemOutcome::Cancelled),
            Err(err) => self.log_failure(application, domain, &err),
        }
    }

    fn record_usage(&self, application: &Application, usage: &[crate::executor::UsageSample]) {
        let now = self.ctx.clock.now();
        for sample in usage {
            let record = jobpilot_core::model::ModelUsage {
                id: uuid::Uuid::new_v4(),
                session_id: application.session_id,
                application_id: Some(application.id),
                provider: sample.provider.clone(),
                model: sample.model.clone(),
                purpose: sample.purpose.clone(),
                tokens_in: sample.tokens_in,
                tokens_out: sample.tokens_out,
                cost_micros: sample.cost_micros,
                started_at: now,
                ended_at: Some(now),
                status: jobpilot_core::model::UsageStatus::Ok,
            };
            if let Err(err) = self.ctx.repo.append_usage(&record) {
                warn!(application_id = %application.id, %err, "failed to record model usage");
            }
        }
        let (tokens_in, tokens_out, cost_micros) = usage.iter().fold((0, 0, 0), |(i, o, c), u| {
            (i + u.tokens_in, o + u.tokens_out, c + u.cost_micros)
        });
        if tokens_in + tokens_out + cost_micros > 0 {
            if let Err(err) =
                self.ctx
                    .repo
                    .add_application_usage(application.id, tokens_in, tokens_out, cost_micros)
            {
                warn!(application_id = %application.id, %err, "failed to add usage counters");
            }
        }
    }

    fn report(
        &self,
        application: &Application,
        domain: &str,
        outcome: ItemOutcome,
    ) -> WorkerReport {
        WorkerReport {
            worker_id: self.id,
            application_id: application.id,
            domain: domain.to_string(),
            outcome,
            decommission: self.consecutive_failures >= self.ctx.max_consecutive_failures,
        }
    }

    fn log_failure(
        &self,
        application: &Application,
        domain: &str,
        err: &EventLogError,
    ) -> WorkerReport {
        error!(application_id = %application.id, %err, "event log unwritable");
        WorkerReport {
            worker_id: self.id,
            application_id: application.id,
            domain: domain.to_string(),
            outcome: ItemOutcome::LogFailure {
                message: err.to_string(),
            },
            decommission: false,
        }
    }
}

enum InterventionStep {
    /// Resume the executor with the next attempt number.
    Resume,
    /// The item reached a terminal state.
    Done(WorkerReport),
}

/// Resolves when the cancel signal becomes non-`None`; pends forever if the
/// sender is gone (nobody can cancel any more).
async fn wait_cancel(rx: &mut watch::Receiver<CancelReason>) -> CancelReason {
    loop {
        let current = *rx.borrow();
        if current != CancelReason::None {
            return current;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
