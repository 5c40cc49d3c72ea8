//! Persistence contract.
//!
//! Everything the control plane writes goes through [`Repository`]. The
//! contract's one hard rule: an application status update is a single
//! transaction that (i) updates the application row, (ii) appends a
//! status-history row, and (iii) appends the corresponding event. Counter
//! updates are additive and may be coalesced, but must commit before the
//! session transitions to a terminal status.
//!
//! The SQLite implementation lives in [`sqlite`].

pub mod sqlite;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jobpilot_core::digest::SessionDigest;
use jobpilot_core::governor::DomainPolicy;
use jobpilot_core::model::{
    Application, ApplicationId, ApplicationStatus, CounterDelta, Event, FieldDescriptor,
    ModelUsage, Question, Session, SessionId, SessionStatus, StateError, ValueSource,
};

pub use sqlite::SqliteRepository;

/// Repository errors.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Row not found.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Identifier as text.
        id: String,
    },

    /// A status update violates the entity's state machine.
    #[error(transparent)]
    IllegalTransition(#[from] StateError),

    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A persisted blob failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Counters on a terminal session are frozen.
    #[error("session '{0}' is terminal; counters are frozen")]
    Frozen(String),
}

impl RepositoryError {
    /// Whether retrying the operation could succeed (lock contention,
    /// busy database). Used by the event log's bounded retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Durable state for sessions, applications, questions, events, usage,
/// digests, and domain policies.
///
/// Implementations must be safe to share across worker tasks; all methods
/// take `&self`.
pub trait Repository: Send + Sync {
    // --- Sessions ---

    /// Persists a new session.
    fn create_session(&self, session: &Session) -> Result<()>;

    /// Loads a session by id.
    fn get_session(&self, id: SessionId) -> Result<Session>;

    /// Updates a session's status, validating the transition.
    fn update_session_status(&self, id: SessionId, to: SessionStatus) -> Result<()>;

    /// Applies an additive counter delta.
    ///
    /// Fails with [`RepositoryError::Frozen`] once the session is terminal.
    fn add_session_counters(&self, id: SessionId, delta: &CounterDelta) -> Result<()>;

    /// Moves a session to a terminal status and stamps `ended_at`.
    fn mark_session_terminal(
        &self,
        id: SessionId,
        to: SessionStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Stamps `started_at` on first dispatch.
    fn set_session_started(&self, id: SessionId, at: DateTime<Utc>) -> Result<()>;

    /// Refreshes the liveness heartbeat.
    fn touch_heartbeat(&self, id: SessionId, at: DateTime<Utc>) -> Result<()>;

    /// Lists non-terminal sessions whose heartbeat is older than `expiry`.
    fn list_stale_sessions(&self, expiry: DateTime<Utc>) -> Result<Vec<Session>>;

    // --- Applications ---

    /// Persists a new application in `queued` status.
    fn create_application(&self, app: &Application) -> Result<()>;

    /// Loads an application by id.
    fn get_application(&self, id: ApplicationId) -> Result<Application>;

    /// Atomically: validates and applies the status transition, appends a
    /// status-history row, and appends `event` — one transaction.
    ///
    /// `reason` populates the failure code/detail columns for terminal
    /// statuses.
    fn update_application_status(
        &self,
        id: ApplicationId,
        to: ApplicationStatus,
        reason: Option<(&str, &str)>,
        event: &Event,
    ) -> Result<()>;

    /// Records the chosen effort and QA flag at dispatch.
    fn set_application_effort(
        &self,
        id: ApplicationId,
        effort: jobpilot_core::model::Effort,
        qa_required: bool,
    ) -> Result<()>;

    /// Stamps timing columns; `None` leaves a column unchanged.
    fn set_application_timing(
        &self,
        id: ApplicationId,
        started_at: Option<DateTime<Utc>>,
        submitted_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Adds token/cost usage to the application's accumulators.
    fn add_application_usage(
        &self,
        id: ApplicationId,
        tokens_in: u64,
        tokens_out: u64,
        cost_micros: u64,
    ) -> Result<()>;

    /// Queued applications for a session, oldest first, up to `limit`.
    fn list_queued(&self, session: SessionId, limit: u32) -> Result<Vec<Application>>;

    /// Applications currently `in_progress` or `paused` for a session.
    fn list_in_progress(&self, session: SessionId) -> Result<Vec<Application>>;

    /// Every application of a session, by enqueue order.
    fn list_applications(&self, session: SessionId) -> Result<Vec<Application>>;

    // --- Questions ---

    /// Appends a question record; the repository assigns the next strictly
    /// increasing `step_index` and returns it.
    #[allow(clippy::too_many_arguments)]
    fn append_question(
        &self,
        application: ApplicationId,
        field: &FieldDescriptor,
        value: &str,
        source: ValueSource,
        confidence: f64,
        validation_error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<u32>;

    /// Question records for an application, by step index.
    fn list_questions(&self, application: ApplicationId) -> Result<Vec<Question>>;

    // --- Events ---

    /// Appends an event. Idempotent on `(session_id, seq)`: replaying the
    /// same sequence is a no-op, which makes the event log's retry safe.
    fn append_event(&self, event: &Event) -> Result<()>;

    /// Highest sequence number recorded for a session, or 0.
    fn max_event_seq(&self, session: SessionId) -> Result<u64>;

    /// All events of a session ordered by `(seq)`.
    fn list_events(&self, session: SessionId) -> Result<Vec<Event>>;

    // --- Model usage ---

    /// Appends a model-usage record.
    fn append_usage(&self, usage: &ModelUsage) -> Result<()>;

    /// Usage records for a session.
    fn list_usage(&self, session: SessionId) -> Result<Vec<ModelUsage>>;

    // --- Digests ---

    /// Inserts or replaces the session digest.
    fn upsert_digest(&self, digest: &SessionDigest) -> Result<()>;

    /// Loads the session digest, if one was persisted.
    fn get_digest(&self, session: SessionId) -> Result<Option<SessionDigest>>;

    // --- Domain policies ---

    /// Loads every persisted domain policy.
    fn load_domain_policies(&self) -> Result<HashMap<String, DomainPolicy>>;

    /// Inserts or replaces one domain policy.
    fn upsert_domain_policy(&self, domain: &str, policy: &DomainPolicy) -> Result<()>;
}
