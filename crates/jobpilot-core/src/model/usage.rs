//! Model-usage records: one LLM or embedding call, attributed for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApplicationId, SessionId};

/// Outcome of one model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    /// The call completed.
    Ok,
    /// The call errored; token counts may be partial.
    Error,
}

impl UsageStatus {
    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// One model call attributed to an application, or to a session directly
/// for unattributed calls such as profile embeddings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUsage {
    /// Record identifier.
    pub id: Uuid,
    /// Owning session.
    pub session_id: SessionId,
    /// Application, when attributable.
    pub application_id: Option<ApplicationId>,
    /// Provider name, e.g. `anthropic`.
    pub provider: String,
    /// Model name.
    pub model: String,
    /// Call purpose, e.g. `cover_letter`, `field_answer`, `qa`.
    pub purpose: String,
    /// Input tokens.
    pub tokens_in: u64,
    /// Output tokens.
    pub tokens_out: u64,
    /// Estimated cost in micro-dollars.
    pub cost_micros: u64,
    /// Call start.
    pub started_at: DateTime<Utc>,
    /// Call end.
    pub ended_at: Option<DateTime<Utc>>,
    /// Call outcome.
    pub status: UsageStatus,
}
