//! End-to-end scenario runs against the full control plane with a scripted
//! executor and an in-memory repository, on the paused tokio clock.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{assert_event_shape, events_for, job, HarnessBuilder, MockBehavior};
use jobpilot_core::config::{SessionConfig, StealthConfig};
use jobpilot_core::governor::DomainPolicy;
use jobpilot_core::model::{reasons, ApplicationStatus, EventType, SessionStatus};
use jobpilot_engine::executor::InterventionKind;
use jobpilot_engine::notify::NotifyKind;
use jobpilot_engine::repo::Repository;

fn session_config(max_items: u32, max_concurrency: u32, budget: f64) -> SessionConfig {
    SessionConfig {
        max_items,
        max_duration_secs: 3600,
        max_concurrency,
        budget_cost: budget,
        timezone: "UTC".to_string(),
        effort_policy_ref: None,
        stealth_policy_ref: None,
    }
}

/// Scenario A: a single low-match job is auto-skipped and the session
/// completes with nothing spent.
#[tokio::test(start_paused = true)]
async fn scenario_low_match_auto_skip() {
    let harness = HarnessBuilder::new()
        .score("careers.example.com", 0.15)
        .build();
    let controller = &harness.controller;

    let session_id = controller
        .create_session(uuid::Uuid::new_v4(), &session_config(10, 1, 1.0))
        .unwrap();
    let ids = controller
        .enqueue_items(session_id, &[job("https://careers.example.com/jobs/1")])
        .await
        .unwrap();
    controller.start(session_id).unwrap();
    let status = controller.wait(session_id).await.unwrap();
    assert_eq!(status, SessionStatus::Completed);

    let app = harness.repo.get_application(ids[0]).unwrap();
    assert_eq!(app.status, ApplicationStatus::Skipped);
    assert_eq!(app.failure_code.as_deref(), Some(reasons::LOW_MATCH));

    let events = harness.repo.list_events(session_id).unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::ItemQueued,
            EventType::ItemSkipped,
            EventType::SessionCompleted,
        ]
    );

    let session = harness.repo.get_session(session_id).unwrap();
    assert_eq!(session.counters.attempted, 1);
    assert_eq!(session.counters.skipped, 1);
    assert_eq!(session.counters.succeeded, 0);
    assert_eq!(session.counters.failed, 0);
    assert_eq!(session.counters.tokens_in + session.counters.tokens_out, 0);
    assert!(session.counters.conserved());
    assert_event_shape(&harness.repo, session_id);
}

/// Scenario B: two jobs on one domain with `min_interval 60` and
/// `max_concurrent 1` serialize even though two workers are free, and both
/// submit without tripping the domain.
#[tokio::test(start_paused = true)]
async fn scenario_same_domain_rate_serialization() {
    let stealth = StealthConfig {
        default: DomainPolicy::default(),
        domains: HashMap::from([(
            "ats.company.com".to_string(),
            DomainPolicy {
                max_per_day: 20,
                min_interval_secs: 60,
                max_concurrent: 1,
                ..DomainPolicy::default()
            },
        )]),
    };
    let harness = HarnessBuilder::new()
        .stealth(stealth)
        .behavior(
            "ats.company.com",
            MockBehavior::Submit {
                after: Duration::from_secs(5),
                tokens: (1_000, 400, 20_000),
            },
        )
        .build();
    let controller = &harness.controller;

    let session_id = controller
        .create_session(uuid::Uuid::new_v4(), &session_config(2, 2, 5.0))
        .unwrap();
    controller
        .enqueue_items(
            session_id,
            &[
                job("https://ats.company.com/jobs/1"),
                job("https://ats.company.com/jobs/2"),
            ],
        )
        .await
        .unwrap();
    controller.start(session_id).unwrap();
    let status = controller.wait(session_id).await.unwrap();
    assert_eq!(status, SessionStatus::Completed);

    let session = harness.repo.get_session(session_id).unwrap();
    assert_eq!(session.counters.attempted, 2);
    assert_eq!(session.counters.succeeded, 2);

    let events = harness.repo.list_events(session_id).unwrap();
    assert!(
        !events
            .iter()
            .any(|e| e.event_type == EventType::DomainBlocked),
        "no domain_blocked event expected"
    );
    let starts: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::ItemStarted)
        .collect();
    assert_eq!(starts.len(), 2);
    let gap = (starts[1].at - starts[0].at).num_seconds();
    assert!(gap >= 60, "starts only {gap}s apart");
    assert_event_shape(&harness.repo, session_id);
}

/// Scenario C: the executor requests an intervention, nobody resolves it,
/// the item fails with `intervention_timeout`, exactly one `captcha_manual`
/// notification fires, and the controller still runs a second session to
/// completion afterwards.
#[tokio::test(start_paused = true)]
async fn scenario_intervention_timeout() {
    let mut harness = HarnessBuilder::new()
        .behavior(
            "guarded.example.com",
            MockBehavior::Intervene {
                kind: InterventionKind::Captcha,
            },
        )
        .settings(|s| s.intervention_timeout = Duration::from_secs(30))
        .build();
    let controller = harness.controller.clone();

    let session_id = controller
        .create_session(uuid::Uuid::new_v4(), &session_config(1, 1, 1.0))
        .unwrap();
    let ids = controller
        .enqueue_items(session_id, &[job("https://guarded.example.com/jobs/1")])
        .await
        .unwrap();
    controller.start(session_id).unwrap();
    let status = controller.wait(session_id).await.unwrap();
    assert_eq!(status, SessionStatus::Completed);

    let app = harness.repo.get_application(ids[0]).unwrap();
    assert_eq!(app.status, ApplicationStatus::Failed);
    assert_eq!(
        app.failure_code.as_deref(),
        Some(reasons::INTERVENTION_TIMEOUT)
    );

    let events = harness.repo.list_events(session_id).unwrap();
    assert_eq!(
        events_for(&events, ids[0]),
        vec![
            EventType::ItemQueued,
            EventType::ItemStarted,
            EventType::CaptchaFailed,
            EventType::InterventionRequested,
            EventType::InterventionTimeout,
            EventType::ItemFailed,
        ]
    );
    assert_eq!(
        events.last().map(|e| e.event_type),
        Some(EventType::SessionCompleted)
    );

    // Exactly one captcha_manual notification (plus the digest).
    let mut captcha_notifications = 0;
    while let Ok((kind, _)) = harness.notifications.try_recv() {
        if kind == NotifyKind::CaptchaManual {
            captcha_notifications += 1;
        }
    }
    assert_eq!(captcha_notifications, 1);

    // The pool survives: a fresh session on the same controller completes.
    let second = controller
        .create_session(uuid::Uuid::new_v4(), &session_config(1, 1, 1.0))
        .unwrap();
    controller
        .enqueue_items(second, &[job("https://open.example.com/jobs/2")])
        .await
        .unwrap();
    controller.start(second).unwrap();
    assert_eq!(
        controller.wait(second).await.unwrap(),
        SessionStatus::Completed
    );
    let session = harness.repo.get_session(second).unwrap();
    assert_eq!(session.counters.succeeded, 1);
}

/// An intervention resolved with `continue` resumes the item, which then
/// submits; the resolution round-trip leaves the expected audit trail.
#[tokio::test(start_paused = true)]
async fn intervention_resolved_continue_resumes() {
    let harness = HarnessBuilder::new()
        .behavior(
            "guarded.example.com",
            MockBehavior::Intervene {
                kind: InterventionKind::TwoFactor,
            },
        )
        .settings(|s| s.intervention_timeout = Duration::from_secs(300))
        .build();
    let controller = harness.controller.clone();

    let session_id = controller
        .create_session(uuid::Uuid::new_v4(), &session_config(1, 1, 1.0))
        .unwrap();
    let ids = controller
        .enqueue_items(session_id, &[job("https://guarded.example.com/jobs/9")])
        .await
        .unwrap();
    controller.start(session_id).unwrap();

    // Resolve once the request is pending.
    let resolver = controller.clone();
    let app_id = ids[0];
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let outcome = resolver.resolve_intervention(
                app_id,
                jobpilot_engine::intervention::Resolution {
                    action: jobpilot_engine::intervention::InterventionAction::Continue,
                    reason: "code_entered".to_string(),
                    payload: None,
                },
            );
            if outcome == jobpilot_engine::intervention::ResolveOutcome::Delivered {
                break;
            }
        }
    });

    let status = controller.wait(session_id).await.unwrap();
    assert_eq!(status, SessionStatus::Completed);

    let app = harness.repo.get_application(ids[0]).unwrap();
    assert_eq!(app.status, ApplicationStatus::Submitted);

    let events = harness.repo.list_events(session_id).unwrap();
    let stream = events_for(&events, ids[0]);
    assert_eq!(
        stream,
        vec![
            EventType::ItemQueued,
            EventType::ItemStarted,
            EventType::TwoFactorRequested,
            EventType::InterventionRequested,
            EventType::TwoFactorSupplied,
            EventType::InterventionResolved,
            EventType::ItemSubmitted,
        ]
    );
    assert_event_shape(&harness.repo, session_id);
}
