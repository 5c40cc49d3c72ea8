//! Shared test harness: scripted executor, scripted matcher, and assertion
//! helpers over the persisted event log.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use jobpilot_core::config::StealthConfig;
use jobpilot_core::effort::{EffortPolicyFile, LoadedEffortPolicy};
use jobpilot_core::model::{
    Application, ApplicationId, Effort, Event, EventType, JobSpec, SessionId,
};
use jobpilot_engine::executor::{
    AnsweredField, ApplicationExecutor, ExecutorError, ExecutorFactory, InterventionKind,
    Matcher, RunOutcome, SubmissionReport, UsageSample,
};
use jobpilot_engine::notify::{ChannelNotifier, Notifier, NotifyKind};
use jobpilot_engine::repo::{Repository, SqliteRepository};
use jobpilot_engine::session::{ControllerParts, EngineSettings, SessionController};

/// Scripted behavior for one job URL (matched by substring).
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Submit successfully after a delay.
    Submit {
        /// Simulated fill time.
        after: Duration,
        /// Tokens and cost reported on success.
        tokens: (u64, u64, u64),
    },
    /// Fail with a reason code.
    Fail {
        /// Reason code reported.
        reason: String,
        /// Whether the domain blocked us.
        domain_blocked: bool,
    },
    /// Request an intervention on the first attempt, submit on resume.
    Intervene {
        /// Kind of intervention requested.
        kind: InterventionKind,
    },
    /// Panic inside the executor.
    Panic,
    /// Never return until cancelled.
    Hang,
}

/// Executor driven by a URL-keyed script.
pub struct MockExecutor {
    behaviors: Arc<HashMap<String, MockBehavior>>,
}

impl ApplicationExecutor for MockExecutor {
    fn run<'a>(
        &'a self,
        application: &'a Application,
        _effort: Effort,
        attempt: u32,
    ) -> BoxFuture<'a, Result<RunOutcome, ExecutorError>> {
        let behavior = self
            .behaviors
            .iter()
            .find(|(key, _)| application.job_url.contains(key.as_str()))
            .map(|(_, b)| b.clone())
            .unwrap_or(MockBehavior::Submit {
                after: Duration::from_millis(10),
                tokens: (100, 50, 1_000),
            });
        Box::pin(async move {
            match behavior {
                MockBehavior::Submit {
                    after,
                    tokens: (tokens_in, tokens_out, cost_micros),
                } => {
                    tokio::time::sleep(after).await;
                    Ok(RunOutcome::Submitted(SubmissionReport {
                        questions: vec![AnsweredField {
                            field: jobpilot_core::model::FieldDescriptor {
                                field_type: "text".into(),
                                label: "full name".into(),
                                raw_label: "Full Name".into(),
                                required: true,
                            },
                            value: "Test User".into(),
                            source: jobpilot_core::model::ValueSource::Profile,
                            confidence: 0.95,
                            validation_error: None,
                        }],
                        usage: vec![UsageSample {
                            provider: "mock".into(),
                            model: "mock-1".into(),
                            purpose: "form_fill".into(),
                            tokens_in,
                            tokens_out,
                            cost_micros,
                        }],
                        confirmation: Some("application received".into()),
                    }))
                }
                MockBehavior::Fail {
                    reason,
                    domain_blocked,
                } => Ok(RunOutcome::Failed {
                    reason,
                    detail: "scripted failure".into(),
                    domain_blocked,
                    usage: vec![],
                }),
                MockBehavior::Intervene { kind } => {
                    if attempt == 0 {
                        Ok(RunOutcome::NeedsIntervention {
                            kind,
                            payload: serde_json::json!({"page": application.job_url}),
                        })
                    } else {
                        Ok(RunOutcome::Submitted(SubmissionReport::default()))
                    }
                }
                MockBehavior::Panic => panic!("scripted executor panic"),
                MockBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(6 * 3600)).await;
                    Ok(RunOutcome::Failed {
                        reason: "hang_elapsed".into(),
                        detail: String::new(),
                        domain_blocked: false,
                        usage: vec![],
                    })
                }
            }
        })
    }
}

/// Factory handing every worker its own scripted executor.
pub struct MockFactory {
    behaviors: Arc<HashMap<String, MockBehavior>>,
}

impl ExecutorFactory for MockFactory {
    fn create(&self, _worker_id: usize) -> Arc<dyn ApplicationExecutor> {
        Arc::new(MockExecutor {
            behaviors: self.behaviors.clone(),
        })
    }
}

/// Matcher scripted by URL substring; falls back to 0.8.
pub struct MockMatcher {
    scores: HashMap<String, f64>,
}

impl Matcher for MockMatcher {
    fn score<'a>(&'a self, job: &'a JobSpec) -> BoxFuture<'a, f64> {
        let score = self
            .scores
            .iter()
            .find(|(key, _)| job.url.contains(key.as_str()))
            .map_or(0.8, |(_, s)| *s);
        Box::pin(async move { score })
    }
}

/// Everything a test needs.
pub struct Harness {
    /// Shared repository.
    pub repo: Arc<SqliteRepository>,
    /// The controller under test.
    pub controller: Arc<SessionController>,
    /// Captured notifications.
    pub notifications: tokio::sync::mpsc::UnboundedReceiver<(NotifyKind, Value)>,
}

/// Builder for the harness.
pub struct HarnessBuilder {
    stealth: StealthConfig,
    settings: EngineSettings,
    behaviors: HashMap<String, MockBehavior>,
    scores: HashMap<String, f64>,
    effort_policy: Option<LoadedEffortPolicy>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        let mut settings = EngineSettings::default();
        // Tight ticks keep paused-clock tests fast.
        settings.tick_interval = Duration::from_millis(20);
        Self {
            stealth: StealthConfig::default(),
            settings,
            behaviors: HashMap::new(),
            scores: HashMap::new(),
            effort_policy: None,
        }
    }

    pub fn stealth(mut self, stealth: StealthConfig) -> Self {
        self.stealth = stealth;
        self
    }

    pub fn settings(mut self, f: impl FnOnce(&mut EngineSettings)) -> Self {
        f(&mut self.settings);
        self
    }

    pub fn behavior(mut self, url_key: &str, behavior: MockBehavior) -> Self {
        self.behaviors.insert(url_key.to_string(), behavior);
        self
    }

    pub fn score(mut self, url_key: &str, score: f64) -> Self {
        self.scores.insert(url_key.to_string(), score);
        self
    }

    pub fn build(self) -> Harness {
        let repo = Arc::new(SqliteRepository::open_in_memory().expect("in-memory repo"));
        let (notifier, notifications) = ChannelNotifier::new();
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);
        let effort_policy = self.effort_policy.unwrap_or_else(default_effort_policy);
        let controller = SessionController::new(ControllerParts {
            repo: repo.clone(),
            factory: Arc::new(MockFactory {
                behaviors: Arc::new(self.behaviors),
            }),
            matcher: Arc::new(MockMatcher {
                scores: self.scores,
            }),
            notifier,
            stealth: self.stealth,
            effort_policy,
            settings: self.settings,
            timezone: chrono::FixedOffset::east_opt(0).expect("utc offset"),
        })
        .expect("controller");
        Harness {
            repo,
            controller: Arc::new(controller),
            notifications,
        }
    }
}

/// The effort policy used across scenario tests: skip below 0.20, upgrade
/// strong matches.
pub fn default_effort_policy() -> LoadedEffortPolicy {
    EffortPolicyFile::from_json(
        r#"{
            "skip_threshold": 0.20,
            "thresholds": { "high_match": 0.85 },
            "upgrade_rules": [
                { "when": "match_score >= high_match", "to": "high", "reason": "strong match" }
            ],
            "qa_rules": [
                { "when": "hint_effort == 'high'" }
            ],
            "cost_ceilings": { "low": 0.02, "medium": 0.10, "high": 0.50 }
        }"#,
    )
    .expect("policy json")
    .compile()
    .expect("policy compiles")
}

/// A plain job spec for a URL.
pub fn job(url: &str) -> JobSpec {
    JobSpec {
        url: url.to_string(),
        title: Some("Software Engineer".to_string()),
        company: Some("Example Corp".to_string()),
        description: None,
        company_tier: jobpilot_core::model::CompanyTier::Normal,
        hint_effort: Effort::Medium,
    }
}

/// Events belonging to one application, in sequence order.
pub fn events_for(events: &[Event], id: ApplicationId) -> Vec<EventType> {
    events
        .iter()
        .filter(|e| e.application_id == Some(id))
        .map(|e| e.event_type)
        .collect()
}

/// Asserts the per-application event-stream shape: strictly increasing
/// sequence, `item_queued` first, at most one `item_started`, exactly one
/// terminal event.
pub fn assert_event_shape(repo: &SqliteRepository, session: SessionId) {
    let events = repo.list_events(session).expect("events");
    let mut last_seq = 0;
    for event in &events {
        assert!(event.seq > last_seq, "sequence not strictly increasing");
        last_seq = event.seq;
    }
    let mut per_app: HashMap<ApplicationId, Vec<EventType>> = HashMap::new();
    for event in &events {
        if let Some(id) = event.application_id {
            per_app.entry(id).or_default().push(event.event_type);
        }
    }
    for (id, stream) in per_app {
        assert_eq!(
            stream.first(),
            Some(&EventType::ItemQueued),
            "{id}: first event must be item_queued"
        );
        let starts = stream
            .iter()
            .filter(|t| **t == EventType::ItemStarted)
            .count();
        assert!(starts <= 1, "{id}: more than one item_started");
        let terminals = stream.iter().filter(|t| t.is_item_terminal()).count();
        assert_eq!(terminals, 1, "{id}: expected exactly one terminal event");
    }
}
