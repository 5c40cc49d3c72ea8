//! Application items: one attempt at one job posting within one session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{SessionId, StateError};

/// Opaque application identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationId(pub Uuid);

impl ApplicationId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ApplicationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ApplicationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Coarse effort level controlling how much work the executor performs.
///
/// Levels are totally ordered: `Low < Medium < High`. Upgrade rules may only
/// raise the level, downgrade rules may only lower it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    /// Minimal form fill, no tailored content.
    Low,
    /// Tailored cover letter.
    Medium,
    /// Tailored cover letter plus QA review pass.
    High,
}

impl Effort {
    /// Parses an effort level from its stable string form.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnknownEffort` for anything other than
    /// `low`, `medium`, or `high` (case-insensitive).
    pub fn parse(s: &str) -> Result<Self, StateError> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(StateError::UnknownEffort(s.to_string())),
        }
    }

    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for Effort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Company tier attached to a job at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyTier {
    /// Priority target; policies typically upgrade effort.
    Top,
    /// No special treatment.
    Normal,
    /// Never apply; evaluator returns an immediate skip.
    Avoid,
}

impl CompanyTier {
    /// Parses a tier from its stable string form.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnknownTier` for unrecognized strings.
    pub fn parse(s: &str) -> Result<Self, StateError> {
        match s.to_ascii_lowercase().as_str() {
            "top" => Ok(Self::Top),
            "normal" => Ok(Self::Normal),
            "avoid" => Ok(Self::Avoid),
            _ => Err(StateError::UnknownTier(s.to_string())),
        }
    }

    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Normal => "normal",
            Self::Avoid => "avoid",
        }
    }
}

impl std::fmt::Display for CompanyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lifecycle state of an application item.
///
/// Legal transitions:
///
/// ```text
/// queued ──▶ in_progress ──▶ submitted | failed | cancelled
///    │            │▲
///    │            ▼│  (intervention round-trip)
///    │          paused ──▶ failed | skipped | cancelled
///    └──▶ skipped | failed | cancelled
/// ```
///
/// `paused -> in_progress` is the only backward edge; everything else is
/// monotonic. `Submitted`, `Failed`, `Skipped`, and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    /// Waiting for dispatch.
    Queued,
    /// Held by exactly one worker.
    InProgress,
    /// Form submitted; terminal.
    Submitted,
    /// Terminal failure with a reason code.
    Failed,
    /// Awaiting a human intervention resolution.
    Paused,
    /// Skipped by policy or admission; terminal.
    Skipped,
    /// Cancelled with the session; terminal.
    Cancelled,
}

impl ApplicationStatus {
    /// Parses a status from its stable string form.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnknownStatus` for unrecognized strings.
    pub fn parse(s: &str) -> Result<Self, StateError> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "submitted" => Ok(Self::Submitted),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(StateError::UnknownStatus {
                entity: "application",
                value: s.to_string(),
            }),
        }
    }

    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Submitted => "submitted",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this status admits no further transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Queued, Self::InProgress)
                | (Self::Queued, Self::Skipped)
                | (Self::Queued, Self::Failed)
                | (Self::Queued, Self::Cancelled)
                | (Self::InProgress, Self::Submitted)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Paused)
                | (Self::InProgress, Self::Cancelled)
                | (Self::Paused, Self::InProgress)
                | (Self::Paused, Self::Failed)
                | (Self::Paused, Self::Skipped)
                | (Self::Paused, Self::Cancelled)
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
                entity: "application",
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate job handed to `enqueue_items`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job posting URL.
    pub url: String,
    /// Posting title, if known.
    #[serde(default)]
    pub title: Option<String>,
    /// Company name, if known.
    #[serde(default)]
    pub company: Option<String>,
    /// Full job description text, if already scraped.
    #[serde(default)]
    pub description: Option<String>,
    /// Company tier; defaults to `normal`.
    #[serde(default = "default_tier")]
    pub company_tier: CompanyTier,
    /// Caller's suggested effort; defaults to `medium`.
    #[serde(default = "default_hint")]
    pub hint_effort: Effort,
}

const fn default_tier() -> CompanyTier {
    CompanyTier::Normal
}

const fn default_hint() -> Effort {
    Effort::Medium
}

/// One attempt at one job posting by one user within one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    /// Opaque identifier.
    pub id: ApplicationId,
    /// Owning session.
    pub session_id: SessionId,
    /// User on whose behalf we apply.
    pub user_id: Uuid,
    /// Job posting URL.
    pub job_url: String,
    /// Posting title, if known.
    pub job_title: Option<String>,
    /// Company name, if known.
    pub company: Option<String>,
    /// Company tier at enqueue time.
    pub company_tier: CompanyTier,
    /// Canonicalized host of `job_url`; the rate-governor key.
    pub domain: String,
    /// Caller's suggested effort.
    pub hint_effort: Effort,
    /// Effort chosen by the policy evaluator; set at dispatch.
    pub effort: Option<Effort>,
    /// Semantic match score in `[0, 1]`.
    pub match_score: f64,
    /// Current lifecycle status.
    pub status: ApplicationStatus,
    /// Session-scoped, strictly increasing enqueue ordinal.
    pub enqueue_seq: i64,
    /// Resume reference handed to the executor.
    pub resume_ref: Option<String>,
    /// Profile reference handed to the executor.
    pub profile_ref: Option<String>,
    /// Failure reason code, for `failed`/`skipped`/`cancelled`.
    pub failure_code: Option<String>,
    /// Free-text failure detail.
    pub failure_detail: Option<String>,
    /// Input tokens consumed by calls attributed to this item.
    pub tokens_in: u64,
    /// Output tokens consumed by calls attributed to this item.
    pub tokens_out: u64,
    /// Estimated cost in micro-dollars.
    pub cost_micros: u64,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// First `in_progress` time.
    pub started_at: Option<DateTime<Utc>>,
    /// Submission time.
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Application {
    /// Builds a queued application from a job spec.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidUrl` when no domain can be derived from
    /// the job URL.
    pub fn from_spec(
        session_id: SessionId,
        user_id: Uuid,
        spec: &JobSpec,
        match_score: f64,
        enqueue_seq: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, StateError> {
        let domain = domain_of_url(&spec.url)?;
        Ok(Self {
            id: ApplicationId::new(),
            session_id,
            user_id,
            job_url: spec.url.clone(),
            job_title: spec.title.clone(),
            company: spec.company.clone(),
            company_tier: spec.company_tier,
            domain,
            hint_effort: spec.hint_effort,
            effort: None,
            match_score: match_score.clamp(0.0, 1.0),
            status: ApplicationStatus::Queued,
            enqueue_seq,
            resume_ref: None,
            profile_ref: None,
            failure_code: None,
            failure_detail: None,
            tokens_in: 0,
            tokens_out: 0,
            cost_micros: 0,
            created_at: now,
            started_at: None,
            submitted_at: None,
        })
    }

    /// Priority bucket for dispatch ordering: `floor(match_score * 10)`,
    /// clamped to `[0, 10]`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn score_bucket(&self) -> u8 {
        (self.match_score.clamp(0.0, 1.0) * 10.0).floor() as u8
    }
}

/// Derives the rate-governor key from a job URL.
///
/// The key is the canonicalized host: scheme, path, query, port, and
/// credentials are stripped; the host is lowercased and a leading `www.`
/// label is removed.
///
/// # Errors
///
/// Returns `StateError::InvalidUrl` when the URL has no host.
pub fn domain_of_url(url: &str) -> Result<String, StateError> {
    let rest = url
        .split_once("://")
        .map_or(url, |(_, rest)| rest);
    // Drop credentials, then path/query/fragment, then port.
    let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
    let host = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    let host = host.trim().to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() || !host.contains('.') {
        return Err(StateError::InvalidUrl(url.to_string()));
    }
    Ok(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_canonicalization() {
        assert_eq!(
            domain_of_url("https://www.Example.com/jobs/123?x=1").unwrap(),
            "example.com"
        );
        assert_eq!(
            domain_of_url("http://ats.company.com:8443/apply").unwrap(),
            "ats.company.com"
        );
        assert_eq!(
            domain_of_url("careers.example.com/postings/4").unwrap(),
            "careers.example.com"
        );
        assert!(domain_of_url("not a url").is_err());
        assert!(domain_of_url("https:///path-only").is_err());
    }

    #[test]
    fn test_effort_ordering() {
        assert!(Effort::Low < Effort::Medium);
        assert!(Effort::Medium < Effort::High);
        assert_eq!(Effort::parse("HIGH").unwrap(), Effort::High);
        assert!(Effort::parse("extreme").is_err());
    }

    #[test]
    fn test_legal_transitions() {
        use ApplicationStatus as S;
        assert!(S::Queued.can_transition_to(S::InProgress));
        assert!(S::InProgress.can_transition_to(S::Paused));
        assert!(S::Paused.can_transition_to(S::InProgress));
        assert!(S::Paused.can_transition_to(S::Failed));
        assert!(S::InProgress.can_transition_to(S::Submitted));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        use ApplicationStatus as S;
        let all = [
            S::Queued,
            S::InProgress,
            S::Submitted,
            S::Failed,
            S::Paused,
            S::Skipped,
            S::Cancelled,
        ];
        // Terminal statuses admit nothing.
        for from in [S::Submitted, S::Failed, S::Skipped, S::Cancelled] {
            for to in all {
                assert!(from.transition_to(to).is_err(), "{from} -> {to}");
            }
        }
        // Terminal rows must never re-enter the queue.
        assert!(matches!(
            S::Submitted.transition_to(S::Queued),
            Err(StateError::IllegalTransition { .. })
        ));
        // Skipping something already running is illegal.
        assert!(S::InProgress.transition_to(S::Skipped).is_err());
        assert!(S::Queued.transition_to(S::Submitted).is_err());
    }

    #[test]
    fn test_score_bucket() {
        let mut spec = JobSpec {
            url: "https://a.example.com/x".into(),
            title: None,
            company: None,
            description: None,
            company_tier: CompanyTier::Normal,
            hint_effort: Effort::Medium,
        };
        spec.title = Some("Engineer".into());
        let app = Application::from_spec(
            SessionId::new(),
            Uuid::new_v4(),
            &spec,
            0.87,
            1,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(app.score_bucket(), 8);
    }
}
