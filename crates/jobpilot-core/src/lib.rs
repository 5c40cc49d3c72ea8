//! # jobpilot-core
//!
//! Core domain logic for jobpilot, an autonomous job-application
//! orchestrator. This crate holds everything that can be expressed without
//! I/O: the data model and its state machines, the effort policy evaluator
//! and its restricted predicate language, the per-domain rate governor, the
//! session budget ledger, and digest computation.
//!
//! The async control plane (dispatcher, worker pool, session controller,
//! persistence) lives in `jobpilot-engine`; this crate is deliberately
//! synchronous and deterministic so that every decision it makes can be
//! unit-tested without a runtime.
//!
//! ## Modules
//!
//! - [`model`]: sessions, applications, questions, events, model usage
//! - [`effort`]: policy-driven effort selection and the predicate language
//! - [`governor`]: per-domain admission control (rate, concurrency, caps)
//! - [`budget`]: monotonic session cost/token ledger
//! - [`digest`]: terminal session summaries and event replay
//! - [`config`]: configuration file formats and the session config snapshot

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod budget;
pub mod config;
pub mod digest;
pub mod effort;
pub mod governor;
pub mod model;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::budget::BudgetLedger;
    pub use crate::config::{SessionConfig, StealthConfig};
    pub use crate::digest::SessionDigest;
    pub use crate::effort::{Decision, LoadedEffortPolicy, Signals};
    pub use crate::governor::{Admission, RateGovernor, ReleaseOutcome};
    pub use crate::model::{
        Application, ApplicationId, ApplicationStatus, Effort, EventType, Session, SessionId,
        SessionStatus,
    };
}
