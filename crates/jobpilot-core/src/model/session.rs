//! Sessions: bounded orchestrated runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StateError;

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Session lifecycle status.
///
/// ```text
/// planned ──start──▶ running ──pause──▶ paused ──resume──▶ running
///                       │                  │
///                       ├─ limits ─▶ draining ──▶ completed
///                       ├─ cancel ─▶ cancelling ─▶ cancelled
///                       └─ fatal ──▶ failing ────▶ failed
/// ```
///
/// `Draining`, `Cancelling`, and `Failing` are the observable teardown
/// phases; they persist so a crash mid-teardown is distinguishable from a
/// crash mid-run. `Completed`, `Failed`, and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, not yet started.
    Planned,
    /// Dispatching work.
    Running,
    /// Dispatch suspended by the operator.
    Paused,
    /// Limits reached; in-flight items finishing.
    Draining,
    /// Cancellation signalled; in-flight items winding down.
    Cancelling,
    /// Fatal error encountered; winding down.
    Failing,
    /// Terminal: ran to completion (or drained).
    Completed,
    /// Terminal: fatal error.
    Failed,
    /// Terminal: cancelled by the operator.
    Cancelled,
}

impl SessionStatus {
    /// Parses a status from its stable string form.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnknownStatus` for unrecognized strings.
    pub fn parse(s: &str) -> Result<Self, StateError> {
        match s {
            "planned" => Ok(Self::Planned),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "draining" => Ok(Self::Draining),
            "cancelling" => Ok(Self::Cancelling),
            "failing" => Ok(Self::Failing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(StateError::UnknownStatus {
                entity: "session",
                value: s.to_string(),
            }),
        }
    }

    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Draining => "draining",
            Self::Cancelling => "cancelling",
            Self::Failing => "failing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this status admits no further transitions. Once terminal,
    /// counters are frozen; only a digest and linked events may be written.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Planned, Self::Running)
                | (Self::Planned, Self::Cancelled)
                | (Self::Running, Self::Paused)
                | (Self::Running, Self::Draining)
                | (Self::Running, Self::Cancelling)
                | (Self::Running, Self::Failing)
                | (Self::Paused, Self::Running)
                | (Self::Paused, Self::Draining)
                | (Self::Paused, Self::Cancelling)
                | (Self::Paused, Self::Failing)
                | (Self::Draining, Self::Completed)
                | (Self::Draining, Self::Cancelling)
                | (Self::Draining, Self::Failing)
                | (Self::Cancelling, Self::Cancelled)
                | (Self::Failing, Self::Failed)
        )
    }

    /// Validates `self -> to`.
    ///
    /// # Errors
    ///
    /// Returns `StateError::IllegalTransition` if the transition is not in
    /// the state machine.
    pub fn transition_to(&self, to: Self) -> Result<(), StateError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(StateError::IllegalTransition {
                entity: "session",
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hard limits a session must not exceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLimits {
    /// Maximum number of attempted items.
    pub max_items: u32,
    /// Maximum wall-clock duration in seconds.
    pub max_duration_secs: u64,
    /// Maximum concurrent workers.
    pub max_concurrency: u32,
    /// Cost budget in micro-dollars.
    pub budget_micros: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_items: 25,
            max_duration_secs: 4 * 3600,
            max_concurrency: 5,
            budget_micros: 5_000_000,
        }
    }
}

/// Session counters.
///
/// Conservation invariant, enforced by [`SessionCounters::conserved`]:
/// `attempted == succeeded + failed + skipped + cancelled + in_flight`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    /// Items dispatched or skipped.
    pub attempted: u32,
    /// Items submitted successfully.
    pub succeeded: u32,
    /// Items that reached `failed`.
    pub failed: u32,
    /// Items skipped by policy or admission.
    pub skipped: u32,
    /// Items cancelled after dispatch.
    pub cancelled: u32,
    /// Items currently held by workers.
    pub in_flight: u32,
    /// Input tokens across attributed model calls.
    pub tokens_in: u64,
    /// Output tokens across attributed model calls.
    pub tokens_out: u64,
    /// Estimated cost in micro-dollars.
    pub cost_micros: u64,
}

impl SessionCounters {
    /// Whether the conservation invariant holds.
    #[must_use]
    pub const fn conserved(&self) -> bool {
        self.attempted
            == self.succeeded + self.failed + self.skipped + self.cancelled + self.in_flight
    }

    /// Applies an additive delta in place.
    pub fn apply(&mut self, delta: &CounterDelta) {
        self.attempted = self.attempted.saturating_add_signed(delta.attempted);
        self.succeeded = self.succeeded.saturating_add_signed(delta.succeeded);
        self.failed = self.failed.saturating_add_signed(delta.failed);
        self.skipped = self.skipped.saturating_add_signed(delta.skipped);
        self.cancelled = self.cancelled.saturating_add_signed(delta.cancelled);
        self.in_flight = self.in_flight.saturating_add_signed(delta.in_flight);
        self.tokens_in = self.tokens_in.saturating_add(delta.tokens_in);
        self.tokens_out = self.tokens_out.saturating_add(delta.tokens_out);
        self.cost_micros = self.cost_micros.saturating_add(delta.cost_micros);
    }
}

/// Additive counter update, coalescable by the repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    /// Delta to `attempted`.
    pub attempted: i32,
    /// Delta to `succeeded`.
    pub succeeded: i32,
    /// Delta to `failed`.
    pub failed: i32,
    /// Delta to `skipped`.
    pub skipped: i32,
    /// Delta to `cancelled`.
    pub cancelled: i32,
    /// Delta to `in_flight`.
    pub in_flight: i32,
    /// Tokens-in increment (never negative).
    pub tokens_in: u64,
    /// Tokens-out increment (never negative).
    pub tokens_out: u64,
    /// Cost increment in micro-dollars (never negative).
    pub cost_micros: u64,
}

impl CounterDelta {
    /// Delta for a freshly dispatched item.
    #[must_use]
    pub const fn dispatched() -> Self {
        Self {
            attempted: 1,
            in_flight: 1,
            ..Self::zero()
        }
    }

    /// Delta for an item skipped before dispatch.
    #[must_use]
    pub const fn skipped() -> Self {
        Self {
            attempted: 1,
            skipped: 1,
            ..Self::zero()
        }
    }

    const fn zero() -> Self {
        Self {
            attempted: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cancelled: 0,
            in_flight: 0,
            tokens_in: 0,
            tokens_out: 0,
            cost_micros: 0,
        }
    }
}

/// One bounded orchestrated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque identifier.
    pub id: SessionId,
    /// Owning user.
    pub user_id: Uuid,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Hard limits.
    pub limits: SessionLimits,
    /// Counters; frozen once terminal.
    pub counters: SessionCounters,
    /// Config snapshot taken at creation; immutable afterwards.
    pub config_snapshot: serde_json::Value,
    /// Session timezone as a fixed offset string, e.g. `"+02:00"`.
    pub timezone: String,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// First dispatch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time.
    pub ended_at: Option<DateTime<Utc>>,
    /// Liveness heartbeat, refreshed by the controller loop.
    pub heartbeat_at: Option<DateTime<Utc>>,
}
