//! Intervention bridge.
//!
//! Mediates human-in-the-loop events: a worker files a request and awaits a
//! typed resolution; an external endpoint (bot, CLI) posts the resolution.
//! The bridge is process-scoped state keyed by application id and survives
//! any number of in-flight requests across workers and sessions.
//!
//! Resolutions are idempotent: the first `resolve` for an application wins,
//! a second is logged and ignored. A request that outlives its deadline
//! resolves to `Skip` with the timeout reason.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

use jobpilot_core::model::{reasons, ApplicationId};

use crate::executor::InterventionKind;
use crate::notify::{Notifier, NotifyKind};

/// What the human decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionAction {
    /// The obstacle is cleared; resume the item.
    Continue,
    /// Give up on this item, mark it skipped.
    Skip,
    /// Give up on this item, mark it failed.
    Abort,
}

impl InterventionAction {
    /// Parses an action from its stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "continue" => Some(Self::Continue),
            "skip" => Some(Self::Skip),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }

    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Skip => "skip",
            Self::Abort => "abort",
        }
    }
}

/// A typed resolution delivered back to the waiting worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// The action taken.
    pub action: InterventionAction,
    /// Stable reason code, e.g. `intervention_timeout`.
    pub reason: String,
    /// Optional payload (a 2FA code, solved-captcha token).
    pub payload: Option<Value>,
}

impl Resolution {
    /// The resolution synthesized when the deadline expires.
    #[must_use]
    pub fn timed_out() -> Self {
        Self {
            action: InterventionAction::Skip,
            reason: reasons::INTERVENTION_TIMEOUT.to_string(),
            payload: None,
        }
    }
}

/// Outcome of posting a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Delivered to the waiting worker.
    Delivered,
    /// Already resolved; this resolution was ignored.
    Duplicate,
    /// No request is pending for the application.
    NotPending,
}

struct Pending {
    tx: oneshot::Sender<Resolution>,
}

/// The process-scoped intervention bridge.
pub struct InterventionBridge {
    pending: Mutex<HashMap<ApplicationId, Pending>>,
    notifier: Arc<dyn Notifier>,
}

impl InterventionBridge {
    /// Creates a bridge forwarding requests to the given sink.
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    /// Files a request and awaits the resolution, bounded by `deadline`.
    ///
    /// The notification sink is pinged exactly once per request. On
    /// deadline expiry the pending entry is cleared and
    /// [`Resolution::timed_out`] is returned.
    pub async fn request(
        &self,
        kind: InterventionKind,
        application_id: ApplicationId,
        payload: Value,
        deadline: Duration,
    ) -> Resolution {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if pending.insert(application_id, Pending { tx }).is_some() {
                warn!(%application_id, "replacing an existing pending intervention");
            }
        }

        let notify_kind = match kind {
            InterventionKind::TwoFactor => NotifyKind::TwoFactorNeeded,
            InterventionKind::Captcha | InterventionKind::Suspicious => NotifyKind::CaptchaManual,
        };
        self.notifier.notify(
            notify_kind,
            &serde_json::json!({
                "application_id": application_id.to_string(),
                "kind": kind.as_str(),
                "payload": payload,
            }),
        );

        let resolution = match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(resolution)) => resolution,
            // Sender dropped or deadline hit: either way the item skips.
            Ok(Err(_)) | Err(_) => Resolution::timed_out(),
        };
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&application_id);
        resolution
    }

    /// Posts a resolution for a pending request. Idempotent: the second
    /// resolve for the same application is ignored and logged.
    pub fn resolve(&self, application_id: ApplicationId, resolution: Resolution) -> ResolveOutcome {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&application_id);
        match entry {
            Some(pending) => {
                if pending.tx.send(resolution).is_err() {
                    // Worker stopped waiting (timeout raced the resolve).
                    info!(%application_id, "resolution arrived after the worker gave up");
                    ResolveOutcome::Duplicate
                } else {
                    ResolveOutcome::Delivered
                }
            }
            None => {
                info!(%application_id, "ignoring resolution with no pending request");
                ResolveOutcome::NotPending
            }
        }
    }

    /// Number of requests currently awaiting resolution.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelNotifier;

    fn bridge() -> (Arc<InterventionBridge>, tokio::sync::mpsc::UnboundedReceiver<(NotifyKind, Value)>)
    {
        let (notifier, rx) = ChannelNotifier::new();
        (Arc::new(InterventionBridge::new(Arc::new(notifier))), rx)
    }

    #[tokio::test]
    async fn test_resolve_delivers() {
        let (bridge, mut notifications) = bridge();
        let app = ApplicationId::new();
        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .request(
                        InterventionKind::TwoFactor,
                        app,
                        serde_json::json!({}),
                        Duration::from_secs(60),
                    )
                    .await
            })
        };
        // The notification fires once the request is filed.
        let (kind, payload) = notifications.recv().await.unwrap();
        assert_eq!(kind, NotifyKind::TwoFactorNeeded);
        assert_eq!(payload["application_id"], app.to_string());

        let outcome = bridge.resolve(
            app,
            Resolution {
                action: InterventionAction::Continue,
                reason: "code_entered".to_string(),
                payload: Some(serde_json::json!({"code": "123456"})),
            },
        );
        assert_eq!(outcome, ResolveOutcome::Delivered);
        let resolution = waiter.await.unwrap();
        assert_eq!(resolution.action, InterventionAction::Continue);
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_resolve_is_ignored() {
        let (bridge, _notifications) = bridge();
        let app = ApplicationId::new();
        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .request(
                        InterventionKind::Captcha,
                        app,
                        serde_json::json!({}),
                        Duration::from_secs(60),
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;
        let first = bridge.resolve(
            app,
            Resolution {
                action: InterventionAction::Continue,
                reason: "solved".to_string(),
                payload: None,
            },
        );
        let second = bridge.resolve(
            app,
            Resolution {
                action: InterventionAction::Abort,
                reason: "changed_mind".to_string(),
                payload: None,
            },
        );
        assert_eq!(first, ResolveOutcome::Delivered);
        assert_eq!(second, ResolveOutcome::NotPending);
        assert_eq!(waiter.await.unwrap().action, InterventionAction::Continue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_to_skip() {
        let (bridge, _notifications) = bridge();
        let app = ApplicationId::new();
        let resolution = bridge
            .request(
                InterventionKind::Captcha,
                app,
                serde_json::json!({}),
                Duration::from_secs(30),
            )
            .await;
        assert_eq!(resolution.action, InterventionAction::Skip);
        assert_eq!(resolution.reason, reasons::INTERVENTION_TIMEOUT);
        assert_eq!(bridge.pending_count(), 0);
    }
}
