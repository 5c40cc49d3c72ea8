//! One-way notification sinks.
//!
//! The control plane pushes exactly four kinds of notification out-of-band;
//! transports (messaging bots, email) implement [`Notifier`] elsewhere.
//! Real-time sinks receive only intervention requests and fatal errors —
//! everything else waits for the digest.

use serde_json::Value;
use tracing::info;

/// Notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyKind {
    /// A CAPTCHA needs manual solving.
    CaptchaManual,
    /// A two-factor code is needed.
    TwoFactorNeeded,
    /// The terminal session digest.
    SessionDigest,
    /// A session-fatal error.
    FatalError,
}

impl NotifyKind {
    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CaptchaManual => "captcha_manual",
            Self::TwoFactorNeeded => "two_factor_needed",
            Self::SessionDigest => "session_digest",
            Self::FatalError => "fatal_error",
        }
    }
}

/// A one-shot, fire-and-forget notification sink.
pub trait Notifier: Send + Sync {
    /// Delivers one notification. Must not block on slow transports;
    /// implementations queue internally.
    fn notify(&self, kind: NotifyKind, payload: &Value);
}

/// Sink that logs notifications through `tracing`. The default when no
/// transport is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, kind: NotifyKind, payload: &Value) {
        info!(kind = kind.as_str(), %payload, "notification");
    }
}

/// Sink that forwards notifications onto an unbounded channel; used by
/// tests to observe deliveries.
#[derive(Debug)]
pub struct ChannelNotifier {
    tx: tokio::sync::mpsc::UnboundedSender<(NotifyKind, Value)>,
}

impl ChannelNotifier {
    /// Creates the sink and its receiving end.
    #[must_use]
    pub fn new() -> (
        Self,
        tokio::sync::mpsc::UnboundedReceiver<(NotifyKind, Value)>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, kind: NotifyKind, payload: &Value) {
        // Receiver gone means nobody is watching; dropping is correct.
        let _ = self.tx.send((kind, payload.clone()));
    }
}
