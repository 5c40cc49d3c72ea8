//! Append-only audit events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApplicationId, SessionId, StateError};

/// The closed event vocabulary.
///
/// Events are never updated or deleted. Ordering within a session is by the
/// log-assigned sequence number; identical timestamps are broken by sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Item created and queued.
    ItemQueued,
    /// Worker picked the item up.
    ItemStarted,
    /// Form submitted; item terminal.
    ItemSubmitted,
    /// Item terminal failure.
    ItemFailed,
    /// Item skipped before dispatch.
    ItemSkipped,
    /// Item cancelled after dispatch.
    ItemCancelled,
    /// Executor detected a CAPTCHA.
    CaptchaDetected,
    /// CAPTCHA solved (automatically or by a human).
    CaptchaSolved,
    /// Automatic CAPTCHA solving failed.
    CaptchaFailed,
    /// Executor hit a two-factor prompt.
    TwoFactorRequested,
    /// A two-factor code was supplied.
    TwoFactorSupplied,
    /// Governor deferred a dispatch attempt.
    RateLimitApplied,
    /// Domain tripwire: cooldown applied.
    DomainBlocked,
    /// A worker panicked while holding an item.
    WorkerCrashed,
    /// Dispatch suspended.
    SessionPaused,
    /// Dispatch resumed.
    SessionResumed,
    /// Session reached `completed`.
    SessionCompleted,
    /// Session reached `cancelled`.
    SessionCancelled,
    /// Session reached `failed`.
    SessionFailed,
    /// Human intervention requested.
    InterventionRequested,
    /// Human intervention resolved.
    InterventionResolved,
    /// Intervention deadline expired without a resolution.
    InterventionTimeout,
}

impl EventType {
    /// Parses an event type from its stable string form.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnknownEventType` for strings outside the
    /// vocabulary.
    pub fn parse(s: &str) -> Result<Self, StateError> {
        match s {
            "item_queued" => Ok(Self::ItemQueued),
            "item_started" => Ok(Self::ItemStarted),
            "item_submitted" => Ok(Self::ItemSubmitted),
            "item_failed" => Ok(Self::ItemFailed),
            "item_skipped" => Ok(Self::ItemSkipped),
            "item_cancelled" => Ok(Self::ItemCancelled),
            "captcha_detected" => Ok(Self::CaptchaDetected),
            "captcha_solved" => Ok(Self::CaptchaSolved),
            "captcha_failed" => Ok(Self::CaptchaFailed),
            "two_factor_requested" => Ok(Self::TwoFactorRequested),
            "two_factor_supplied" => Ok(Self::TwoFactorSupplied),
            "rate_limit_applied" => Ok(Self::RateLimitApplied),
            "domain_blocked" => Ok(Self::DomainBlocked),
            "worker_crashed" => Ok(Self::WorkerCrashed),
            "session_paused" => Ok(Self::SessionPaused),
            "session_resumed" => Ok(Self::SessionResumed),
            "session_completed" => Ok(Self::SessionCompleted),
            "session_cancelled" => Ok(Self::SessionCancelled),
            "session_failed" => Ok(Self::SessionFailed),
            "intervention_requested" => Ok(Self::InterventionRequested),
            "intervention_resolved" => Ok(Self::InterventionResolved),
            "intervention_timeout" => Ok(Self::InterventionTimeout),
            _ => Err(StateError::UnknownEventType(s.to_string())),
        }
    }

    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ItemQueued => "item_queued",
            Self::ItemStarted => "item_started",
            Self::ItemSubmitted => "item_submitted",
            Self::ItemFailed => "item_failed",
            Self::ItemSkipped => "item_skipped",
            Self::ItemCancelled => "item_cancelled",
            Self::CaptchaDetected => "captcha_detected",
            Self::CaptchaSolved => "captcha_solved",
            Self::CaptchaFailed => "captcha_failed",
            Self::TwoFactorRequested => "two_factor_requested",
            Self::TwoFactorSupplied => "two_factor_supplied",
            Self::RateLimitApplied => "rate_limit_applied",
            Self::DomainBlocked => "domain_blocked",
            Self::WorkerCrashed => "worker_crashed",
            Self::SessionPaused => "session_paused",
            Self::SessionResumed => "session_resumed",
            Self::SessionCompleted => "session_completed",
            Self::SessionCancelled => "session_cancelled",
            Self::SessionFailed => "session_failed",
            Self::InterventionRequested => "intervention_requested",
            Self::InterventionResolved => "intervention_resolved",
            Self::InterventionTimeout => "intervention_timeout",
        }
    }

    /// Whether this event terminates an item's event stream.
    #[must_use]
    pub const fn is_item_terminal(&self) -> bool {
        matches!(
            self,
            Self::ItemSubmitted | Self::ItemFailed | Self::ItemSkipped | Self::ItemCancelled
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Record identifier.
    pub id: Uuid,
    /// Owning session.
    pub session_id: SessionId,
    /// Application, when the event is item-scoped.
    pub application_id: Option<ApplicationId>,
    /// Session-scoped sequence number, assigned by the event log.
    pub seq: u64,
    /// Event type from the closed vocabulary.
    pub event_type: EventType,
    /// Free-text detail.
    pub detail: Option<String>,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// Wall-clock timestamp.
    pub at: DateTime<Utc>,
}

impl Event {
    /// Builds an event with a fresh record id.
    ///
    /// The sequence number is a placeholder until the event log assigns the
    /// real one; callers outside the log should not construct events
    /// directly.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        application_id: Option<ApplicationId>,
        seq: u64,
        event_type: EventType,
        detail: Option<String>,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            application_id,
            seq,
            event_type,
            detail,
            payload,
            at,
        }
    }
}
