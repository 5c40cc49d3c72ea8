//! The dispatch loop.
//!
//! One dispatcher per running session. Each iteration: promote deferred
//! items whose retry time has come, check session limits, pick the best
//! admissible item, consult the policy evaluator and the rate governor, and
//! hand the item to a free worker. Worker reports come back on a channel
//! and drive governor release, budget settlement, and counter updates.
//!
//! Item selection is a total order: `(score_bucket desc, enqueue_seq asc)`
//! with `score_bucket = floor(match_score * 10)` — better matches go first,
//! but a tiny score gap cannot starve older items forever.
//!
//! The dispatcher also polices the per-item hard timeout: a worker holding
//! an item past `max_item_duration` is signalled, given a grace window, and
//! then abandoned — the item is failed, the governor slot released on its
//! behalf, and a replacement worker spawned.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use jobpilot_core::budget::BudgetLedger;
use jobpilot_core::effort::{LoadedEffortPolicy, Signals};
use jobpilot_core::governor::{Admission, RateGovernor, ReleaseOutcome};
use jobpilot_core::model::{
    reasons, Application, ApplicationId, ApplicationStatus, CounterDelta, EventType, Session,
    SessionCounters, SessionStatus,
};

use crate::clock::EngineClock;
use crate::event_log::EventLog;
use crate::repo::Repository;
use crate::session::EngineSettings;
use crate::worker::{
    Assignment, CancelReason, ItemOutcome, WorkerPool, WorkerReport,
};

/// Operator commands accepted while a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Stop picking new items; in-flight items complete; dispatch resumes
    /// on [`ControlCommand::Resume`].
    Pause,
    /// Resume dispatch after a pause.
    Resume,
    /// Graceful drain to `completed`.
    Stop,
    /// Cooperative cancellation to `cancelled`.
    Cancel,
}

/// How the dispatch loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Queue drained or limits hit; terminal status `completed`.
    Completed,
    /// Cancelled by the operator; terminal status `cancelled`.
    Cancelled,
    /// A session-fatal condition; terminal status `failed`.
    Failed {
        /// Stable reason code.
        reason: String,
        /// Description for the event and notification.
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Paused,
    Draining,
    Cancelling,
    Failing,
}

/// A queued item plus its dispatch priority.
#[derive(Debug)]
struct QueuedEntry {
    bucket: u8,
    enqueue_seq: i64,
    application: Application,
}

impl QueuedEntry {
    fn new(application: Application) -> Self {
        Self {
            bucket: application.score_bucket(),
            enqueue_seq: application.enqueue_seq,
            application,
        }
    }
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.bucket == other.bucket && self.enqueue_seq == other.enqueue_seq
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher bucket wins; within a bucket, older wins.
        self.bucket
            .cmp(&other.bucket)
            .then_with(|| other.enqueue_seq.cmp(&self.enqueue_seq))
    }
}

#[derive(Debug)]
struct DeferredEntry {
    not_before: DateTime<Utc>,
    entry: QueuedEntry,
}

impl PartialEq for DeferredEntry {
    fn eq(&self, other: &Self) -> bool {
        self.not_before == other.not_before && self.entry == other.entry
    }
}

impl Eq for DeferredEntry {}

impl PartialOrd for DeferredEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeferredEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: the soonest retry time wins.
        other
            .not_before
            .cmp(&self.not_before)
            .then_with(|| self.entry.cmp(&other.entry))
    }
}

struct InFlight {
    worker_id: usize,
    application: Application,
    ceiling_micros: u64,
    cancel_tx: watch::Sender<CancelReason>,
    deadline: Instant,
    grace_until: Option<Instant>,
}

/// Everything the dispatcher needs at construction.
pub struct DispatcherParts {
    /// The session being dispatched.
    pub session: Session,
    /// Repository handle.
    pub repo: std::sync::Arc<dyn Repository>,
    /// Event log.
    pub event_log: EventLog,
    /// Shared rate governor.
    pub governor: std::sync::Arc<RateGovernor>,
    /// Compiled effort policy.
    pub policy: std::sync::Arc<LoadedEffortPolicy>,
    /// Engine clock.
    pub clock: EngineClock,
    /// Worker pool, already spawned.
    pub pool: WorkerPool,
    /// Receiving end of the pool's report channel.
    pub report_rx: mpsc::Receiver<WorkerReport>,
    /// Operator control channel.
    pub control_rx: mpsc::UnboundedReceiver<ControlCommand>,
    /// Engine timing settings.
    pub settings: EngineSettings,
}

/// The per-session dispatch loop.
pub struct Dispatcher {
    session: Session,
    repo: std::sync::Arc<dyn Repository>,
    event_log: EventLog,
    governor: std::sync::Arc<RateGovernor>,
    policy: std::sync::Arc<LoadedEffortPolicy>,
    clock: EngineClock,
    pool: WorkerPool,
    report_rx: mpsc::Receiver<WorkerReport>,
    control_rx: mpsc::UnboundedReceiver<ControlCommand>,
    settings: EngineSettings,

    phase: Phase,
    budget: BudgetLedger,
    counters: SessionCounters,
    ready: BinaryHeap<QueuedEntry>,
    deferred: BinaryHeap<DeferredEntry>,
    in_flight: HashMap<ApplicationId, InFlight>,
    free_workers: VecDeque<usize>,
    requeue_counts: HashMap<ApplicationId, u32>,
    defer_logged: HashSet<ApplicationId>,
    started: Instant,
    last_heartbeat: Instant,
}

impl Dispatcher {
    /// Builds a dispatcher over an already-running session.
    #[must_use]
    pub fn new(parts: DispatcherParts) -> Self {
        let free_workers: VecDeque<usize> = parts.pool.worker_ids().into();
        let budget = BudgetLedger::new(parts.session.limits.budget_micros);
        let counters = parts.session.counters;
        let now = Instant::now();
        Self {
            session: parts.session,
            repo: parts.repo,
            event_log: parts.event_log,
            governor: parts.governor,
            policy: parts.policy,
            clock: parts.clock,
            pool: parts.pool,
            report_rx: parts.report_rx,
            control_rx: parts.control_rx,
            settings: parts.settings,
            phase: Phase::Running,
            budget,
            counters,
            ready: BinaryHeap::new(),
            deferred: BinaryHeap::new(),
            in_flight: HashMap::new(),
            free_workers,
            requeue_counts: HashMap::new(),
            defer_logged: HashSet::new(),
            started: now,
            last_heartbeat: now,
        }
    }

    /// Runs the loop to completion and returns how the session ended.
    ///
    /// The caller (the session controller) owns terminal status, digest,
    /// and notifications; the dispatcher persists only the intermediate
    /// statuses (`paused`, `draining`, `cancelling`, `failing`).
    pub async fn run(mut self) -> SessionEnd {
        if let Err(err) = self.load_queue() {
            return self.fail_now(reasons::LOG_WRITE_FAILED, &err.to_string()).await;
        }

        let tick = self.settings.tick_interval;
        loop {
            if self.phase == Phase::Running {
                if let Some(end) = self.dispatch_ready().await {
                    return end;
                }
            }
            if self.finished() {
                break;
            }

            tokio::select! {
                report = self.report_rx.recv() => {
                    match report {
                        Some(report) => {
                            if let Some(end) = self.handle_report(report).await {
                                return end;
                            }
                        }
                        None => break,
                    }
                }
                command = self.control_rx.recv() => {
                    if let Some(command) = command {
                        if let Some(end) = self.handle_control(command).await {
                            return end;
                        }
                    }
                }
                () = tokio::time::sleep(tick) => {
                    if let Some(end) = self.on_tick().await {
                        return end;
                    }
                }
            }
        }

        self.pool.shutdown().await;
        match self.phase {
            Phase::Cancelling => SessionEnd::Cancelled,
            Phase::Failing => SessionEnd::Failed {
                reason: reasons::LOG_WRITE_FAILED.to_string(),
                message: "event log unwritable".to_string(),
            },
            _ => SessionEnd::Completed,
        }
    }

    fn load_queue(&mut self) -> Result<(), crate::repo::RepositoryError> {
        let queued = self
            .repo
            .list_queued(self.session.id, self.session.limits.max_items * 4)?;
        for application in queued {
            self.ready.push(QueuedEntry::new(application));
        }
        debug!(session_id = %self.session.id, queued = self.ready.len(), "queue loaded");
        Ok(())
    }

    fn finished(&self) -> bool {
        match self.phase {
            Phase::Running => {
                self.ready.is_empty() && self.deferred.is_empty() && self.in_flight.is_empty()
            }
            Phase::Paused => false,
            Phase::Draining | Phase::Cancelling | Phase::Failing => self.in_flight.is_empty(),
        }
    }

    /// Dispatches as many ready items as workers and admission allow.
    /// Returns `Some` only on a session-fatal error.
    async fn dispatch_ready(&mut self) -> Option<SessionEnd> {
        self.promote_deferred();

        while !self.free_workers.is_empty() {
            // Session limits, checked before admission.
            if self.counters.attempted >= self.session.limits.max_items {
                self.begin_drain("max_items");
                return None;
            }
            if self.started.elapsed().as_secs() >= self.session.limits.max_duration_secs {
                self.begin_drain("max_duration");
                return None;
            }
            let Some(entry) = self.ready.pop() else {
                return None;
            };

            let application = entry.application;
            let decision = self.policy.evaluate(&Signals {
                hint_effort: application.hint_effort,
                match_score: application.match_score,
                company_tier: application.company_tier,
                domain_policy: Some(self.governor.policy_for(&application.domain)),
            });

            if let Some(reason) = decision.skip_reason.clone() {
                if let Some(end) = self.mark_skipped(application, &reason).await {
                    return Some(end);
                }
                continue;
            }

            let ceiling = self.policy.ceilings().micros(decision.effort);
            if !self.budget.admits(ceiling) {
                // Not this item's fault; the session is out of budget.
                self.ready.push(QueuedEntry::new(application));
                self.begin_drain("budget_exhausted");
                return None;
            }

            let now = self.clock.now();
            match self.governor.try_acquire(&application.domain, now) {
                Admission::Reject { reason } => {
                    if let Some(end) = self.mark_skipped(application, reason).await {
                        return Some(end);
                    }
                }
                Admission::Defer { earliest } => {
                    if self.defer_logged.insert(application.id) {
                        let _ = self
                            .event_log
                            .append(
                                self.session.id,
                                Some(application.id),
                                EventType::RateLimitApplied,
                                None,
                                json!({
                                    "domain": application.domain,
                                    "earliest": earliest.to_rfc3339(),
                                }),
                            )
                            .await;
                    }
                    self.deferred.push(DeferredEntry {
                        not_before: earliest,
                        entry: QueuedEntry::new(application),
                    });
                }
                Admission::Admit { start_delay } => {
                    if let Some(end) = self.assign(application, decision, start_delay).await {
                        return Some(end);
                    }
                }
            }
        }
        None
    }

    async fn assign(
        &mut self,
        application: Application,
        decision: jobpilot_core::effort::Decision,
        start_delay: std::time::Duration,
    ) -> Option<SessionEnd> {
        let worker_id = self
            .free_workers
            .pop_front()
            .expect("dispatch_ready checks for a free worker");
        let ceiling = self.policy.ceilings().micros(decision.effort);
        let effort = decision.effort;

        if let Err(err) =
            self.repo
                .set_application_effort(application.id, effort, decision.qa_required)
        {
            warn!(application_id = %application.id, %err, "failed to record effort");
        }

        let (cancel_tx, cancel_rx) = watch::channel(CancelReason::None);
        let assignment = Assignment {
            application: application.clone(),
            decision,
            start_delay,
            cancel: cancel_rx,
        };

        match self.pool.assign(worker_id, assignment) {
            Ok(()) => {
                self.in_flight.insert(
                    application.id,
                    InFlight {
                        worker_id,
                        application,
                        ceiling_micros: ceiling,
                        cancel_tx,
                        deadline: Instant::now() + self.settings.max_item_duration,
                        grace_until: None,
                    },
                );
                self.budget.reserve(ceiling);
                self.apply_counters(CounterDelta::dispatched()).await
            }
            Err(assignment) => {
                // The worker's channel is wedged; replace it and requeue the
                // item once with backoff.
                self.governor.release(
                    &assignment.application.domain,
                    ReleaseOutcome::Failed,
                    self.clock.now(),
                );
                let new_id = self.pool.replace(worker_id);
                self.free_workers.push_back(new_id);

                let application = assignment.application;
                let attempts = self.requeue_counts.entry(application.id).or_insert(0);
                *attempts += 1;
                if *attempts > 1 {
                    warn!(application_id = %application.id, "assignment failed twice");
                    return self
                        .mark_failed_from_queue(application, reasons::ASSIGNMENT_FAILED)
                        .await;
                }
                self.deferred.push(DeferredEntry {
                    not_before: self.clock.now() + chrono::Duration::seconds(1),
                    entry: QueuedEntry::new(application),
                });
                None
            }
        }
    }

    fn promote_deferred(&mut self) {
        let now = self.clock.now();
        while let Some(head) = self.deferred.peek() {
            if head.not_before > now {
                break;
            }
            let head = self.deferred.pop().unwrap_or_else(|| unreachable!());
            self.ready.push(head.entry);
        }
    }

    async fn mark_skipped(
        &mut self,
        application: Application,
        reason: &str,
    ) -> Option<SessionEnd> {
        let result = self
            .event_log
            .transition(
                &application,
                ApplicationStatus::Skipped,
                Some((reason, reason)),
                EventType::ItemSkipped,
                None,
                json!({ "reason": reason }),
            )
            .await;
        if let Err(err) = result {
            return Some(self.fail_now(reasons::LOG_WRITE_FAILED, &err.to_string()).await);
        }
        info!(application_id = %application.id, reason, "item skipped");
        self.apply_counters(CounterDelta::skipped()).await
    }

    async fn mark_failed_from_queue(
        &mut self,
        application: Application,
        reason: &str,
    ) -> Option<SessionEnd> {
        let result = self
            .event_log
            .transition(
                &application,
                ApplicationStatus::Failed,
                Some((reason, "could not hand the item to any worker")),
                EventType::ItemFailed,
                None,
                json!({ "reason": reason }),
            )
            .await;
        if let Err(err) = result {
            return Some(self.fail_now(reasons::LOG_WRITE_FAILED, &err.to_string()).await);
        }
        self.apply_counters(CounterDelta {
            attempted: 1,
            failed: 1,
            ..CounterDelta::default()
        })
        .await
    }

    async fn handle_report(&mut self, report: WorkerReport) -> Option<SessionEnd> {
        let Some(in_flight) = self.in_flight.remove(&report.application_id) else {
            // Already abandoned on timeout; the slot was released then.
            debug!(application_id = %report.application_id, "late report ignored");
            return None;
        };

        if report.decommission {
            let new_id = self.pool.replace(report.worker_id);
            self.free_workers.push_back(new_id);
        } else {
            self.free_workers.push_back(report.worker_id);
        }

        let now = self.clock.now();
        let delta = match report.outcome {
            ItemOutcome::Submitted {
                tokens_in,
                tokens_out,
                cost_micros,
            } => {
                self.governor
                    .release(&report.domain, ReleaseOutcome::Submitted, now);
                self.settle(in_flight.ceiling_micros, cost_micros, tokens_in, tokens_out);
                CounterDelta {
                    succeeded: 1,
                    in_flight: -1,
                    tokens_in,
                    tokens_out,
                    cost_micros,
                    ..CounterDelta::default()
                }
            }
            ItemOutcome::Failed {
                domain_blocked,
                cost_micros,
                tokens_in,
                tokens_out,
                ..
            } => {
                let outcome = if domain_blocked {
                    ReleaseOutcome::Blocked
                } else {
                    ReleaseOutcome::Failed
                };
                if let Some(blocked_until) = self.governor.release(&report.domain, outcome, now) {
                    let _ = self
                        .event_log
                        .append(
                            self.session.id,
                            Some(report.application_id),
                            EventType::DomainBlocked,
                            None,
                            json!({
                                "domain": report.domain,
                                "blocked_until": blocked_until.to_rfc3339(),
                            }),
                        )
                        .await;
                    let mut policy = self.governor.policy_for(&report.domain).clone();
                    policy.blocked_until = Some(blocked_until);
                    if let Err(err) = self.repo.upsert_domain_policy(&report.domain, &policy) {
                        warn!(domain = %report.domain, %err, "failed to persist cooldown");
                    }
                }
                self.settle(in_flight.ceiling_micros, cost_micros, tokens_in, tokens_out);
                CounterDelta {
                    failed: 1,
                    in_flight: -1,
                    tokens_in,
                    tokens_out,
                    cost_micros,
                    ..CounterDelta::default()
                }
            }
            ItemOutcome::Skipped { .. } => {
                self.governor
                    .release(&report.domain, ReleaseOutcome::Failed, now);
                self.settle(in_flight.ceiling_micros, 0, 0, 0);
                CounterDelta {
                    skipped: 1,
                    in_flight: -1,
                    ..CounterDelta::default()
                }
            }
            ItemOutcome::Cancelled => {
                self.governor
                    .release(&report.domain, ReleaseOutcome::Cancelled, now);
                self.settle(in_flight.ceiling_micros, 0, 0, 0);
                CounterDelta {
                    cancelled: 1,
                    in_flight: -1,
                    ..CounterDelta::default()
                }
            }
            ItemOutcome::LogFailure { message } => {
                self.governor
                    .release(&report.domain, ReleaseOutcome::Failed, now);
                self.settle(in_flight.ceiling_micros, 0, 0, 0);
                let _ = self
                    .apply_counters(CounterDelta {
                        failed: 1,
                        in_flight: -1,
                        ..CounterDelta::default()
                    })
                    .await;
                return Some(self.fail_now(reasons::LOG_WRITE_FAILED, &message).await);
            }
        };
        drop(in_flight.cancel_tx);
        self.apply_counters(delta).await
    }

    fn settle(&mut self, ceiling: u64, cost: u64, tokens_in: u64, tokens_out: u64) {
        if let Err(err) = self.budget.settle(ceiling, cost, tokens_in, tokens_out) {
            warn!(%err, "budget settlement overflow");
        }
    }

    async fn handle_control(&mut self, command: ControlCommand) -> Option<SessionEnd> {
        match (command, self.phase) {
            (ControlCommand::Pause, Phase::Running) => {
                self.phase = Phase::Paused;
                let _ = self
                    .repo
                    .update_session_status(self.session.id, SessionStatus::Paused);
                let _ = self
                    .event_log
                    .append(
                        self.session.id,
                        None,
                        EventType::SessionPaused,
                        None,
                        json!({}),
                    )
                    .await;
                info!(session_id = %self.session.id, "session paused");
            }
            (ControlCommand::Resume, Phase::Paused) => {
                self.phase = Phase::Running;
                let _ = self
                    .repo
                    .update_session_status(self.session.id, SessionStatus::Running);
                let _ = self
                    .event_log
                    .append(
                        self.session.id,
                        None,
                        EventType::SessionResumed,
                        None,
                        json!({}),
                    )
                    .await;
                info!(session_id = %self.session.id, "session resumed");
            }
            (ControlCommand::Stop, Phase::Running | Phase::Paused) => {
                self.begin_drain("operator_stop");
            }
            (ControlCommand::Cancel, Phase::Running | Phase::Paused | Phase::Draining) => {
                self.phase = Phase::Cancelling;
                let _ = self
                    .repo
                    .update_session_status(self.session.id, SessionStatus::Cancelling);
                for in_flight in self.in_flight.values() {
                    let _ = in_flight.cancel_tx.send(CancelReason::Session);
                }
                info!(session_id = %self.session.id, "session cancelling");
            }
            (command, phase) => {
                debug!(?command, ?phase, "control command ignored in this phase");
            }
        }
        None
    }

    fn begin_drain(&mut self, why: &str) {
        if matches!(self.phase, Phase::Draining | Phase::Cancelling | Phase::Failing) {
            return;
        }
        self.phase = Phase::Draining;
        let _ = self
            .repo
            .update_session_status(self.session.id, SessionStatus::Draining);
        info!(session_id = %self.session.id, why, "session draining");
    }

    async fn fail_now(&mut self, reason: &str, message: &str) -> SessionEnd {
        self.phase = Phase::Failing;
        let _ = self
            .repo
            .update_session_status(self.session.id, SessionStatus::Failing);
        for in_flight in self.in_flight.values() {
            let _ = in_flight.cancel_tx.send(CancelReason::Session);
        }
        // Give workers the shutdown window, then abandon the rest.
        let grace = tokio::time::sleep(self.settings.shutdown_window);
        tokio::pin!(grace);
        loop {
            if self.in_flight.is_empty() {
                break;
            }
            tokio::select! {
                report = self.report_rx.recv() => {
                    match report {
                        Some(report) => {
                            self.in_flight.remove(&report.application_id);
                            // The governor outlives this session; give the
                            // slot back even though the session is dying.
                            self.governor.release(
                                &report.domain,
                                ReleaseOutcome::Failed,
                                self.clock.now(),
                            );
                        }
                        None => break,
                    }
                }
                () = &mut grace => break,
            }
        }
        // Anything still in flight after the grace window leaks no governor
        // slot either.
        let leftover: Vec<InFlight> = self.in_flight.drain().map(|(_, v)| v).collect();
        for in_flight in leftover {
            self.governor.release(
                &in_flight.application.domain,
                ReleaseOutcome::Failed,
                self.clock.now(),
            );
        }
        self.pool.shutdown().await;
        SessionEnd::Failed {
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    /// Periodic housekeeping: deferred promotion happens on the next
    /// dispatch pass; here we police hard timeouts and heartbeats.
    async fn on_tick(&mut self) -> Option<SessionEnd> {
        let now_instant = Instant::now();

        if now_instant.duration_since(self.last_heartbeat) >= self.settings.heartbeat_interval {
            self.last_heartbeat = now_instant;
            if let Err(err) = self.repo.touch_heartbeat(self.session.id, self.clock.now()) {
                warn!(%err, "heartbeat write failed");
            }
        }

        // Hard per-item timeout: signal, then abandon after the grace
        // window.
        let mut abandoned: Vec<ApplicationId> = Vec::new();
        for (id, in_flight) in &mut self.in_flight {
            match in_flight.grace_until {
                None if now_instant >= in_flight.deadline => {
                    warn!(application_id = %id, "item exceeded max duration; signalling worker");
                    let _ = in_flight.cancel_tx.send(CancelReason::ItemTimeout);
                    in_flight.grace_until =
                        Some(now_instant + self.settings.shutdown_window);
                }
                Some(grace) if now_instant >= grace => abandoned.push(*id),
                _ => {}
            }
        }
        for id in abandoned {
            if let Some(end) = self.abandon(id).await {
                return Some(end);
            }
        }
        None
    }

    /// Abandons a worker that failed to release its item within the grace
    /// window: abort the task, fail the item on its behalf, release the
    /// governor slot with `outcome=timeout`, spawn a replacement worker.
    async fn abandon(&mut self, id: ApplicationId) -> Option<SessionEnd> {
        let Some(in_flight) = self.in_flight.remove(&id) else {
            return None;
        };
        warn!(
            application_id = %id,
            worker_id = in_flight.worker_id,
            "abandoning unresponsive worker"
        );
        let new_id = self.pool.replace(in_flight.worker_id);
        self.free_workers.push_back(new_id);

        let mut application = in_flight.application;
        // The worker may have died mid-intervention; fail from whichever
        // non-terminal status the row is in.
        if let Ok(current) = self.repo.get_application(application.id) {
            application.status = current.status;
        }
        if !application.status.is_terminal() {
            let result = self
                .event_log
                .transition(
                    &application,
                    ApplicationStatus::Failed,
                    Some((reasons::TIMEOUT, "worker abandoned after grace window")),
                    EventType::ItemFailed,
                    None,
                    json!({
                        "reason": reasons::TIMEOUT,
                        "tokens_in": 0,
                        "tokens_out": 0,
                        "cost_micros": 0,
                    }),
                )
                .await;
            if let Err(err) = result {
                return Some(self.fail_now(reasons::LOG_WRITE_FAILED, &err.to_string()).await);
            }
        }
        self.governor
            .release(&application.domain, ReleaseOutcome::Timeout, self.clock.now());
        self.settle(in_flight.ceiling_micros, 0, 0, 0);
        self.apply_counters(CounterDelta {
            failed: 1,
            in_flight: -1,
            ..CounterDelta::default()
        })
        .await
    }

    async fn apply_counters(&mut self, delta: CounterDelta) -> Option<SessionEnd> {
        self.counters.apply(&delta);
        if let Err(err) = self.repo.add_session_counters(self.session.id, &delta) {
            if err.is_transient() {
                warn!(%err, "counter update deferred by storage contention");
                return None;
            }
            return Some(self.fail_now(reasons::LOG_WRITE_FAILED, &err.to_string()).await);
        }
        None
    }
}
