//! Terminal session digests and event replay.
//!
//! A digest is a pure projection of a finished session: counters, a
//! per-domain breakdown, a per-effort breakdown, and a failure taxonomy
//! carrying up to three example application ids per reason code. The same
//! module holds the event-replay reconstruction used to verify that
//! persisted counters agree with the log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    Application, ApplicationId, ApplicationStatus, Event, EventType, Session, SessionCounters,
    SessionId, SessionStatus,
};

/// Example-id cap per failure reason in the digest.
const EXAMPLES_PER_KIND: usize = 3;

/// Per-domain outcome counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainBreakdown {
    /// Items dispatched or skipped on this domain.
    pub attempted: u32,
    /// Items submitted.
    pub succeeded: u32,
    /// Items failed.
    pub failed: u32,
    /// Items skipped.
    pub skipped: u32,
}

/// Per-failure-reason counts with example application ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureBreakdown {
    /// Number of items that ended with this reason code.
    pub count: u32,
    /// Up to three example application ids.
    pub examples: Vec<ApplicationId>,
}

/// The per-session terminal summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDigest {
    /// The summarized session.
    pub session_id: SessionId,
    /// Terminal status.
    pub status: SessionStatus,
    /// Final counters.
    pub counters: SessionCounters,
    /// Outcomes keyed by domain.
    pub per_domain: BTreeMap<String, DomainBreakdown>,
    /// Submitted-item counts keyed by effort level string.
    pub per_effort: BTreeMap<String, u32>,
    /// Failure taxonomy keyed by reason code.
    pub failures: BTreeMap<String, FailureBreakdown>,
    /// Session start.
    pub started_at: Option<DateTime<Utc>>,
    /// Session end.
    pub ended_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in seconds, when both timestamps exist.
    pub duration_secs: Option<i64>,
}

/// Builds the digest for a session from its application rows.
#[must_use]
pub fn build_digest(session: &Session, applications: &[Application]) -> SessionDigest {
    let mut per_domain: BTreeMap<String, DomainBreakdown> = BTreeMap::new();
    let mut per_effort: BTreeMap<String, u32> = BTreeMap::new();
    let mut failures: BTreeMap<String, FailureBreakdown> = BTreeMap::new();

    for app in applications {
        let domain = per_domain.entry(app.domain.clone()).or_default();
        match app.status {
            ApplicationStatus::Submitted => {
                domain.attempted += 1;
                domain.succeeded += 1;
                let effort = app.effort.map_or("unknown", |e| e.as_str());
                *per_effort.entry(effort.to_string()).or_default() += 1;
            }
            ApplicationStatus::Failed => {
                domain.attempted += 1;
                domain.failed += 1;
                record_failure(&mut failures, app);
            }
            ApplicationStatus::Skipped => {
                domain.attempted += 1;
                domain.skipped += 1;
                record_failure(&mut failures, app);
            }
            ApplicationStatus::Cancelled => {
                domain.attempted += 1;
                record_failure(&mut failures, app);
            }
            // Never dispatched, or still somehow live: not attempted.
            ApplicationStatus::Queued
            | ApplicationStatus::InProgress
            | ApplicationStatus::Paused => {}
        }
    }

    let duration_secs = match (session.started_at, session.ended_at) {
        (Some(start), Some(end)) => Some((end - start).num_seconds()),
        _ => None,
    };

    SessionDigest {
        session_id: session.id,
        status: session.status,
        counters: session.counters,
        per_domain,
        per_effort,
        failures,
        started_at: session.started_at,
        ended_at: session.ended_at,
        duration_secs,
    }
}

fn record_failure(failures: &mut BTreeMap<String, FailureBreakdown>, app: &Application) {
    let code = app
        .failure_code
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    let entry = failures.entry(code).or_default();
    entry.count += 1;
    if entry.examples.len() < EXAMPLES_PER_KIND {
        entry.examples.push(app.id);
    }
}

/// Reconstructs session counters from the persisted event log.
///
/// Token and cost accumulators come from the payloads of terminal item
/// events, which carry `tokens_in` / `tokens_out` / `cost_micros` fields.
/// At a terminal session status this must equal the persisted counters.
#[must_use]
pub fn replay_counters(events: &[Event]) -> SessionCounters {
    let mut c = SessionCounters::default();
    // Items that reach a terminal event without ever starting (policy
    // skips, assignment failures) count as attempted at the terminal
    // event; started items counted theirs at item_started.
    let mut started: std::collections::HashSet<ApplicationId> = std::collections::HashSet::new();
    fn settle(
        c: &mut SessionCounters,
        started: &std::collections::HashSet<ApplicationId>,
        event: &Event,
    ) {
        if event
            .application_id
            .is_some_and(|id| started.contains(&id))
        {
            c.in_flight = c.in_flight.saturating_sub(1);
        } else {
            c.attempted += 1;
        }
    }
    for event in events {
        match event.event_type {
            EventType::ItemStarted => {
                c.attempted += 1;
                c.in_flight += 1;
                if let Some(id) = event.application_id {
                    started.insert(id);
                }
            }
            EventType::ItemSkipped => {
                settle(&mut c, &started, event);
                c.skipped += 1;
            }
            EventType::ItemSubmitted => {
                settle(&mut c, &started, event);
                c.succeeded += 1;
                charge(&mut c, event);
            }
            EventType::ItemFailed => {
                settle(&mut c, &started, event);
                c.failed += 1;
                charge(&mut c, event);
            }
            EventType::ItemCancelled => {
                settle(&mut c, &started, event);
                c.cancelled += 1;
                charge(&mut c, event);
            }
            _ => {}
        }
    }
    c
}

fn charge(c: &mut SessionCounters, event: &Event) {
    let field = |name: &str| {
        event
            .payload
            .get(name)
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    };
    c.tokens_in += field("tokens_in");
    c.tokens_out += field("tokens_out");
    c.cost_micros += field("cost_micros");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompanyTier, Effort, JobSpec, SessionLimits};
    use uuid::Uuid;

    fn spec(url: &str) -> JobSpec {
        JobSpec {
            url: url.to_string(),
            title: None,
            company: None,
            description: None,
            company_tier: CompanyTier::Normal,
            hint_effort: Effort::Medium,
        }
    }

    fn session() -> Session {
        Session {
            id: SessionId::new(),
            user_id: Uuid::new_v4(),
            status: SessionStatus::Completed,
            limits: SessionLimits::default(),
            counters: SessionCounters::default(),
            config_snapshot: serde_json::Value::Null,
            timezone: "UTC".to_string(),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            ended_at: Some(Utc::now() + chrono::Duration::seconds(90)),
            heartbeat_at: None,
        }
    }

    fn app(session: &Session, url: &str, seq: i64) -> Application {
        Application::from_spec(session.id, session.user_id, &spec(url), 0.8, seq, Utc::now())
            .unwrap()
    }

    #[test]
    fn test_digest_breakdowns() {
        let s = session();
        let mut a1 = app(&s, "https://ats.alpha.com/1", 1);
        a1.status = ApplicationStatus::Submitted;
        a1.effort = Some(Effort::High);
        let mut a2 = app(&s, "https://ats.alpha.com/2", 2);
        a2.status = ApplicationStatus::Failed;
        a2.failure_code = Some("timeout".to_string());
        let mut a3 = app(&s, "https://jobs.beta.com/3", 3);
        a3.status = ApplicationStatus::Skipped;
        a3.failure_code = Some("low_match".to_string());

        let digest = build_digest(&s, &[a1.clone(), a2.clone(), a3]);
        assert_eq!(digest.duration_secs, Some(90));
        let alpha = &digest.per_domain["ats.alpha.com"];
        assert_eq!((alpha.attempted, alpha.succeeded, alpha.failed), (2, 1, 1));
        assert_eq!(digest.per_domain["jobs.beta.com"].skipped, 1);
        assert_eq!(digest.per_effort["high"], 1);
        assert_eq!(digest.failures["timeout"].count, 1);
        assert_eq!(digest.failures["timeout"].examples, vec![a2.id]);
    }

    #[test]
    fn test_failure_examples_capped_at_three() {
        let s = session();
        let apps: Vec<Application> = (0..5)
            .map(|i| {
                let mut a = app(&s, "https://ats.alpha.com/x", i);
                a.status = ApplicationStatus::Failed;
                a.failure_code = Some("worker_exception".to_string());
                a
            })
            .collect();
        let digest = build_digest(&s, &apps);
        let wx = &digest.failures["worker_exception"];
        assert_eq!(wx.count, 5);
        assert_eq!(wx.examples.len(), 3);
    }

    #[test]
    fn test_replay_counters() {
        let s = session();
        let a = ApplicationId::new();
        let b = ApplicationId::new();
        let mk = |seq: u64, app: Option<ApplicationId>, t: EventType, payload: serde_json::Value| {
            Event::new(s.id, app, seq, t, None, payload, Utc::now())
        };
        let events = vec![
            mk(1, Some(a), EventType::ItemQueued, serde_json::json!({})),
            mk(2, Some(b), EventType::ItemQueued, serde_json::json!({})),
            mk(3, Some(a), EventType::ItemStarted, serde_json::json!({})),
            mk(4, Some(b), EventType::ItemSkipped, serde_json::json!({})),
            mk(
                5,
                Some(a),
                EventType::ItemSubmitted,
                serde_json::json!({"tokens_in": 900, "tokens_out": 300, "cost_micros": 42_000}),
            ),
            mk(6, None, EventType::SessionCompleted, serde_json::json!({})),
        ];
        let c = replay_counters(&events);
        assert_eq!(c.attempted, 2);
        assert_eq!(c.succeeded, 1);
        assert_eq!(c.skipped, 1);
        assert_eq!(c.in_flight, 0);
        assert_eq!(c.tokens_in, 900);
        assert_eq!(c.cost_micros, 42_000);
        assert!(c.conserved());
    }
}
