//! Append-only event log.
//!
//! A thin, write-mostly layer over the repository that owns sequence-number
//! assignment. Sequence numbers are session-scoped, monotonically
//! increasing, and handed out by an in-memory counter seeded from the
//! persisted maximum when a session is opened — callers never pick their
//! own.
//!
//! Write-ahead discipline: a state transition is acknowledged to the caller
//! only after its event (and, for status transitions, the whole
//! row+history+event transaction) has committed. Transient storage errors
//! are retried in place — same sequence, same payload — with bounded
//! backoff; the idempotent `(session, seq)` insert makes the retry safe.
//! When retries are exhausted the error surfaces to the caller, which
//! escalates to session teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use jobpilot_core::model::{
    Application, ApplicationId, ApplicationStatus, Event, EventType, SessionId,
};

use crate::clock::EngineClock;
use crate::repo::{Repository, RepositoryError};

/// Backoff schedule for transient append failures.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
];

/// Event log errors.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// The write failed after every retry; the session must stop.
    #[error("event log write failed after {attempts} attempts: {source}")]
    WriteExhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// The final error.
        #[source]
        source: RepositoryError,
    },

    /// A non-transient repository error (illegal transition, missing row).
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The session was never opened on this log.
    #[error("session '{0}' is not open on this event log")]
    SessionNotOpen(String),
}

/// The process-wide event log.
#[derive(Clone)]
pub struct EventLog {
    repo: Arc<dyn Repository>,
    clock: EngineClock,
    seqs: Arc<Mutex<HashMap<SessionId, Arc<AtomicU64>>>>,
}

impl EventLog {
    /// Creates a log over the given repository.
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>, clock: EngineClock) -> Self {
        Self {
            repo,
            clock,
            seqs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Opens a session on the log, seeding its sequence counter from the
    /// persisted maximum.
    ///
    /// # Errors
    ///
    /// Returns a repository error if the maximum cannot be read.
    pub fn open_session(&self, session: SessionId) -> Result<(), EventLogError> {
        let max = self.repo.max_event_seq(session)?;
        self.seqs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(session)
            .or_insert_with(|| Arc::new(AtomicU64::new(max)));
        Ok(())
    }

    /// Drops a session's counter after teardown.
    pub fn close_session(&self, session: SessionId) {
        self.seqs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&session);
    }

    fn next_seq(&self, session: SessionId) -> Result<u64, EventLogError> {
        let counter = self
            .seqs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&session)
            .cloned()
            .ok_or_else(|| EventLogError::SessionNotOpen(session.to_string()))?;
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Appends a plain event (no status transition).
    ///
    /// # Errors
    ///
    /// Returns `EventLogError::WriteExhausted` when the bounded retry runs
    /// out, or the underlying repository error when it is not retryable.
    pub async fn append(
        &self,
        session: SessionId,
        application: Option<ApplicationId>,
        event_type: EventType,
        detail: Option<String>,
        payload: Value,
    ) -> Result<Event, EventLogError> {
        let event = Event::new(
            session,
            application,
            self.next_seq(session)?,
            event_type,
            detail,
            payload,
            self.clock.now(),
        );
        self.with_retry(|| self.repo.append_event(&event)).await?;
        Ok(event)
    }

    /// Appends a status-transition event atomically with the application
    /// row update and status-history row.
    ///
    /// # Errors
    ///
    /// Illegal transitions surface as `EventLogError::Repository`
    /// immediately; transient storage errors follow the retry policy.
    pub async fn transition(
        &self,
        application: &Application,
        to: ApplicationStatus,
        reason: Option<(&str, &str)>,
        event_type: EventType,
        detail: Option<String>,
        payload: Value,
    ) -> Result<Event, EventLogError> {
        let event = Event::new(
            application.session_id,
            Some(application.id),
            self.next_seq(application.session_id)?,
            event_type,
            detail,
            payload,
            self.clock.now(),
        );
        self.with_retry(|| {
            self.repo
                .update_application_status(application.id, to, reason, &event)
        })
        .await?;
        Ok(event)
    }

    async fn with_retry<F>(&self, mut op: F) -> Result<(), EventLogError>
    where
        F: FnMut() -> Result<(), RepositoryError>,
    {
        let mut attempts = 1u32;
        let mut last;
        match op() {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => last = e,
            Err(e) => return Err(e.into()),
        }
        for backoff in RETRY_BACKOFF {
            warn!(attempt = attempts, error = %last, "event append failed; retrying");
            tokio::time::sleep(backoff).await;
            attempts += 1;
            match op() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => last = e,
                Err(e) => return Err(e.into()),
            }
        }
        Err(EventLogError::WriteExhausted {
            attempts,
            source: last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::SqliteRepository;
    use chrono::Utc;
    use jobpilot_core::model::{
        CompanyTier, Effort, JobSpec, Session, SessionCounters, SessionLimits, SessionStatus,
    };
    use uuid::Uuid;

    fn harness() -> (Arc<SqliteRepository>, EventLog, SessionId) {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let clock = EngineClock::new();
        let log = EventLog::new(repo.clone(), clock);
        let session = Session {
            id: SessionId::new(),
            user_id: Uuid::new_v4(),
            status: SessionStatus::Planned,
            limits: SessionLimits::default(),
            counters: SessionCounters::default(),
            config_snapshot: serde_json::json!({}),
            timezone: "UTC".to_string(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            heartbeat_at: None,
        };
        repo.create_session(&session).unwrap();
        log.open_session(session.id).unwrap();
        (repo, log, session.id)
    }

    #[tokio::test]
    async fn test_sequences_are_contiguous() {
        let (repo, log, session) = harness();
        for _ in 0..5 {
            log.append(session, None, EventType::SessionPaused, None, serde_json::json!({}))
                .await
                .unwrap();
        }
        let events = repo.list_events(session).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_sequence_seeded_from_persisted_max() {
        let (repo, log, session) = harness();
        log.append(session, None, EventType::SessionPaused, None, serde_json::json!({}))
            .await
            .unwrap();
        log.append(session, None, EventType::SessionResumed, None, serde_json::json!({}))
            .await
            .unwrap();

        // A fresh log over the same repository continues, not restarts.
        let log2 = EventLog::new(repo.clone(), EngineClock::new());
        log2.open_session(session).unwrap();
        let e = log2
            .append(session, None, EventType::SessionPaused, None, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(e.seq, 3);
    }

    #[tokio::test]
    async fn test_transition_writes_event_atomically() {
        let (repo, log, session) = harness();
        let app = Application::from_spec(
            session,
            Uuid::new_v4(),
            &JobSpec {
                url: "https://ats.example.com/1".into(),
                title: None,
                company: None,
                description: None,
                company_tier: CompanyTier::Normal,
                hint_effort: Effort::Medium,
            },
            0.9,
            1,
            Utc::now(),
        )
        .unwrap();
        repo.create_application(&app).unwrap();

        log.transition(
            &app,
            ApplicationStatus::InProgress,
            None,
            EventType::ItemStarted,
            None,
            serde_json::json!({}),
        )
        .await
        .unwrap();

        assert_eq!(
            repo.get_application(app.id).unwrap().status,
            ApplicationStatus::InProgress
        );
        assert_eq!(repo.list_events(session).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unopened_session_is_an_error() {
        let (_repo, log, _session) = harness();
        let other = SessionId::new();
        let err = log
            .append(other, None, EventType::SessionPaused, None, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EventLogError::SessionNotOpen(_)));
    }
}
