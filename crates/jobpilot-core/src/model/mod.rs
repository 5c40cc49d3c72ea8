//! Domain model: identifiers, entities, and their state machines.
//!
//! Every status enum here carries an `as_str`/`parse` pair so the same
//! stable strings appear in the database, in event payloads, and in logs.
//! Transition legality is checked by pure functions; the repository refuses
//! to persist a transition these functions reject.

mod application;
mod event;
mod question;
mod session;
mod usage;

pub use application::{
    Application, ApplicationId, ApplicationStatus, CompanyTier, Effort, JobSpec, domain_of_url,
};
pub use event::{Event, EventType};
pub use question::{FieldDescriptor, Question, ValueSource};
pub use session::{CounterDelta, Session, SessionCounters, SessionId, SessionLimits, SessionStatus};
pub use usage::{ModelUsage, UsageStatus};

/// Stable failure and skip reason codes.
///
/// These strings are persisted on application rows and in event payloads;
/// they must never change meaning once released.
pub mod reasons {
    /// Match score below the configured skip threshold.
    pub const LOW_MATCH: &str = "low_match";
    /// Company tier is `avoid`.
    pub const AVOID_COMPANY: &str = "avoid_company";
    /// Policy evaluation itself failed.
    pub const POLICY_ERROR: &str = "policy_error";
    /// Rate governor rejected the domain outright.
    pub const RATE_REJECTED: &str = "rate_rejected";
    /// Daily per-domain application cap reached.
    pub const DAILY_CAP: &str = "daily_cap";
    /// The worker running the item panicked.
    pub const WORKER_EXCEPTION: &str = "worker_exception";
    /// The external executor reported a failure.
    pub const EXECUTOR_ERROR: &str = "executor_error";
    /// No human resolution arrived before the intervention deadline.
    pub const INTERVENTION_TIMEOUT: &str = "intervention_timeout";
    /// A human resolved the intervention with `skip`.
    pub const INTERVENTION_SKIP: &str = "intervention_skip";
    /// A human resolved the intervention with `abort`.
    pub const INTERVENTION_ABORT: &str = "intervention_abort";
    /// The item exceeded the per-item hard duration limit.
    pub const TIMEOUT: &str = "timeout";
    /// The session was cancelled while the item was in flight.
    pub const SESSION_CANCELLED: &str = "session_cancelled";
    /// Assigning the item to a worker failed twice.
    pub const ASSIGNMENT_FAILED: &str = "assignment_failed";
    /// The owning process died; detected at recovery.
    pub const ORPHANED: &str = "orphaned";
    /// The owning session's process died; detected at recovery.
    pub const PROCESS_DIED: &str = "process_died";
    /// The event log could not be written; session-fatal.
    pub const LOG_WRITE_FAILED: &str = "log_write_failed";
}

/// Errors produced by state-machine and model validation.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// A status transition violates the entity's state machine.
    #[error("illegal {entity} transition: {from} -> {to}")]
    IllegalTransition {
        /// Entity kind, e.g. `"session"` or `"application"`.
        entity: &'static str,
        /// Current status string.
        from: String,
        /// Requested status string.
        to: String,
    },

    /// A status string is not part of the closed vocabulary.
    #[error("unknown {entity} status '{value}'")]
    UnknownStatus {
        /// Entity kind.
        entity: &'static str,
        /// The offending string.
        value: String,
    },

    /// An effort label is not one of `low`, `medium`, `high`.
    #[error("unknown effort level '{0}'")]
    UnknownEffort(String),

    /// A company tier is not one of `top`, `normal`, `avoid`.
    #[error("unknown company tier '{0}'")]
    UnknownTier(String),

    /// An event type string is not part of the closed vocabulary.
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),

    /// A value source string is not recognized.
    #[error("unknown value source '{0}'")]
    UnknownValueSource(String),

    /// A job URL has no extractable host.
    #[error("cannot derive domain from url '{0}'")]
    InvalidUrl(String),
}
