//! External execution seams.
//!
//! The browser executor, the semantic matcher, and the content generator
//! are collaborators of the control plane, not parts of it. They are
//! consumed through the traits here; the engine never observes a browser,
//! only values.
//!
//! The executor boundary is value-based by design: CAPTCHA and 2FA are not
//! exceptions but the [`RunOutcome::NeedsIntervention`] variant, so the
//! worker decides what happens next by matching, not by unwinding.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use jobpilot_core::model::{Application, Effort, FieldDescriptor, JobSpec, ValueSource};

/// Executor errors. These are infrastructure failures — a crashed browser,
/// an exhausted context pool — not form-level outcomes.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The browser context is gone and cannot be rebuilt by this instance.
    #[error("executor resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Any other executor-side failure.
    #[error("executor failure: {0}")]
    Other(String),
}

/// Kind of human intervention an executor may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    /// CAPTCHA that automatic solving could not clear.
    Captcha,
    /// Two-factor authentication prompt.
    TwoFactor,
    /// Suspicious-activity interstitial.
    Suspicious,
}

impl InterventionKind {
    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Captcha => "captcha",
            Self::TwoFactor => "two_factor",
            Self::Suspicious => "suspicious",
        }
    }
}

/// One answered form field reported by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnsweredField {
    /// The field that was filled.
    pub field: FieldDescriptor,
    /// The entered value.
    pub value: String,
    /// Where the value came from.
    pub source: ValueSource,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Validation error the form displayed, if any.
    pub validation_error: Option<String>,
}

/// One model call made during the run, for usage attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSample {
    /// Provider name.
    pub provider: String,
    /// Model name.
    pub model: String,
    /// Call purpose.
    pub purpose: String,
    /// Input tokens.
    pub tokens_in: u64,
    /// Output tokens.
    pub tokens_out: u64,
    /// Estimated cost in micro-dollars.
    pub cost_micros: u64,
}

/// Successful submission report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionReport {
    /// Every field interaction, in fill order.
    pub questions: Vec<AnsweredField>,
    /// Model calls made during the run.
    pub usage: Vec<UsageSample>,
    /// Confirmation evidence, e.g. a confirmation-page phrase.
    pub confirmation: Option<String>,
}

impl SubmissionReport {
    /// Sums usage into `(tokens_in, tokens_out, cost_micros)`.
    #[must_use]
    pub fn totals(&self) -> (u64, u64, u64) {
        self.usage.iter().fold((0, 0, 0), |(i, o, c), u| {
            (i + u.tokens_in, o + u.tokens_out, c + u.cost_micros)
        })
    }
}

/// Value-based outcome of one executor run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The form was filled and submitted.
    Submitted(SubmissionReport),
    /// The run failed; `reason` is a stable code, `detail` free text.
    Failed {
        /// Stable reason code.
        reason: String,
        /// Free-text detail.
        detail: String,
        /// Whether the target domain actively blocked us (tripwire).
        domain_blocked: bool,
        /// Model calls made before the failure.
        usage: Vec<UsageSample>,
    },
    /// A human must act before the run can continue.
    NeedsIntervention {
        /// What kind of intervention.
        kind: InterventionKind,
        /// Payload forwarded to notification sinks (screenshot refs, URLs).
        payload: Value,
    },
}

/// The external browser executor.
///
/// One instance belongs to exactly one worker; instances must not share
/// browser state. `attempt` is 0 for the first run of an item and
/// increments on each post-intervention resume.
pub trait ApplicationExecutor: Send + Sync {
    /// Runs one application at the given effort.
    fn run<'a>(
        &'a self,
        application: &'a Application,
        effort: Effort,
        attempt: u32,
    ) -> BoxFuture<'a, Result<RunOutcome, ExecutorError>>;
}

/// Produces one isolated executor per worker.
pub trait ExecutorFactory: Send + Sync {
    /// Creates the executor owned by worker `worker_id`.
    fn create(&self, worker_id: usize) -> std::sync::Arc<dyn ApplicationExecutor>;
}

/// The external semantic matcher: `score(job) -> [0, 1]`.
pub trait Matcher: Send + Sync {
    /// Scores one job against the user profile.
    fn score<'a>(&'a self, job: &'a JobSpec) -> BoxFuture<'a, f64>;
}

/// A matcher that returns a constant score; the default for dry runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedMatcher(pub f64);

impl Matcher for FixedMatcher {
    fn score<'a>(&'a self, _job: &'a JobSpec) -> BoxFuture<'a, f64> {
        Box::pin(async move { self.0.clamp(0.0, 1.0) })
    }
}

/// A rehearsal executor that fills nothing and submits nothing, but walks
/// the full control-plane path with plausible timings and token counts.
/// Used by the CLI's dry-run mode and by workflow rehearsals.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    /// Simulated fill duration.
    pub fill_duration: std::time::Duration,
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self {
            fill_duration: std::time::Duration::from_secs(2),
        }
    }
}

impl ApplicationExecutor for SimulatedExecutor {
    fn run<'a>(
        &'a self,
        application: &'a Application,
        effort: Effort,
        _attempt: u32,
    ) -> BoxFuture<'a, Result<RunOutcome, ExecutorError>> {
        Box::pin(async move {
            tokio::time::sleep(self.fill_duration).await;
            let (tokens_in, tokens_out, cost_micros) = match effort {
                Effort::Low => (400, 120, 4_000),
                Effort::Medium => (2_400, 900, 30_000),
                Effort::High => (6_000, 2_200, 90_000),
            };
            Ok(RunOutcome::Submitted(SubmissionReport {
                questions: vec![AnsweredField {
                    field: FieldDescriptor {
                        field_type: "text".to_string(),
                        label: "full name".to_string(),
                        raw_label: "Full Name".to_string(),
                        required: true,
                    },
                    value: "(simulated)".to_string(),
                    source: ValueSource::Profile,
                    confidence: 1.0,
                    validation_error: None,
                }],
                usage: vec![UsageSample {
                    provider: "simulated".to_string(),
                    model: "none".to_string(),
                    purpose: "rehearsal".to_string(),
                    tokens_in,
                    tokens_out,
                    cost_micros,
                }],
                confirmation: Some(format!("simulated submission for {}", application.domain)),
            }))
        })
    }
}

/// Factory handing every worker its own [`SimulatedExecutor`].
#[derive(Debug, Clone, Default)]
pub struct SimulatedExecutorFactory {
    /// Simulated fill duration per item.
    pub fill_duration: Option<std::time::Duration>,
}

impl ExecutorFactory for SimulatedExecutorFactory {
    fn create(&self, _worker_id: usize) -> std::sync::Arc<dyn ApplicationExecutor> {
        let mut executor = SimulatedExecutor::default();
        if let Some(d) = self.fill_duration {
            executor.fill_duration = d;
        }
        std::sync::Arc::new(executor)
    }
}
