//! Per-domain admission control.
//!
//! One admission record per target domain enforces four invariants at once:
//! a daily application cap, a minimum interval between starts, a concurrency
//! ceiling, and a block/cooldown tripwire. All state updates for a domain
//! are serialized behind one lock; the governor never holds the lock across
//! an outbound call — it only mutates counters.
//!
//! Time is always passed in by the caller. That keeps the governor
//! deterministic under test and pins the day boundary to the session's
//! configured timezone rather than whatever the host clock says.
//!
//! In-flight counts are process-local and rebuilt as zero on restart; daily
//! counts are re-seeded from event replay by the recovery path.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::reasons;

/// Retry horizon when the only obstacle is a fully occupied concurrency
/// slot; the caller polls again after this long.
const CONCURRENCY_RETRY_SECS: i64 = 1;

/// Per-domain configuration, loaded at session start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPolicy {
    /// Maximum applications started per local day.
    #[serde(default = "default_max_per_day")]
    pub max_per_day: u32,
    /// Minimum seconds between two starts on the same domain.
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
    /// Maximum concurrent in-flight applications on the domain.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Never apply to this domain.
    #[serde(default)]
    pub avoid: bool,
    /// Cooldown applied when a release reports the domain blocked us.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Upper bound for the random start delay added on admission; zero
    /// disables jitter.
    #[serde(default)]
    pub jitter_max_secs: u64,
    /// Cooldown deadline carried over from a previous run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<DateTime<Utc>>,
}

const fn default_max_per_day() -> u32 {
    20
}

const fn default_min_interval() -> u64 {
    60
}

const fn default_max_concurrent() -> u32 {
    1
}

const fn default_cooldown() -> u64 {
    30 * 60
}

impl Default for DomainPolicy {
    fn default() -> Self {
        Self {
            max_per_day: default_max_per_day(),
            min_interval_secs: default_min_interval(),
            max_concurrent: default_max_concurrent(),
            avoid: false,
            cooldown_secs: default_cooldown(),
            jitter_max_secs: 0,
            blocked_until: None,
        }
    }
}

/// Outcome reported when an in-flight slot is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The item submitted successfully.
    Submitted,
    /// The item failed for reasons unrelated to the domain.
    Failed,
    /// The domain rate-limited or blocked us; apply the cooldown.
    Blocked,
    /// The item was abandoned on timeout; slot released on its behalf.
    Timeout,
    /// The item was cancelled with the session.
    Cancelled,
}

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted; the caller may start after `start_delay` (jitter).
    Admit {
        /// Randomized stealth delay before the actual start.
        start_delay: Duration,
    },
    /// Not admissible now; retry no earlier than `earliest`.
    Defer {
        /// Soonest instant at which acquisition could succeed.
        earliest: DateTime<Utc>,
    },
    /// Not admissible today at all.
    Reject {
        /// Stable reason code.
        reason: &'static str,
    },
}

/// Point-in-time view of one domain's state, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSnapshot {
    /// Applications started this local day.
    pub applications_today: u32,
    /// Current in-flight count.
    pub in_flight: u32,
    /// Cooldown deadline, if tripped.
    pub blocked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct DomainState {
    day: Option<NaiveDate>,
    applications_today: u32,
    last_started_at: Option<DateTime<Utc>>,
    in_flight: u32,
    blocked_until: Option<DateTime<Utc>>,
}

impl DomainState {
    fn roll_day(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            self.day = Some(today);
            self.applications_today = 0;
        }
    }
}

/// The per-domain rate governor.
///
/// Shared by every worker in the process; see module docs for the locking
/// discipline.
#[derive(Debug)]
pub struct RateGovernor {
    tz: FixedOffset,
    default_policy: DomainPolicy,
    policies: HashMap<String, DomainPolicy>,
    states: Mutex<HashMap<String, DomainState>>,
}

impl RateGovernor {
    /// Creates a governor with the given timezone and policies.
    #[must_use]
    pub fn new(
        tz: FixedOffset,
        default_policy: DomainPolicy,
        policies: HashMap<String, DomainPolicy>,
    ) -> Self {
        Self {
            tz,
            default_policy,
            policies,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// The policy governing `domain` (explicit entry or the default).
    #[must_use]
    pub fn policy_for(&self, domain: &str) -> &DomainPolicy {
        self.policies.get(domain).unwrap_or(&self.default_policy)
    }

    /// Inserts or replaces the policy for one domain.
    pub fn upsert_policy(&mut self, domain: String, policy: DomainPolicy) {
        self.policies.insert(domain, policy);
    }

    /// Attempts to admit one more start on `domain` at `now`.
    ///
    /// On admission the in-flight count and daily counter are incremented
    /// and `last_started_at` is set, atomically with the checks. Racing
    /// callers observe non-decreasing `earliest` deferrals.
    pub fn try_acquire(&self, domain: &str, now: DateTime<Utc>) -> Admission {
        let policy = self.policy_for(domain).clone();
        if policy.avoid {
            return Admission::Reject {
                reason: reasons::AVOID_COMPANY,
            };
        }

        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = states.entry(domain.to_string()).or_insert_with(|| DomainState {
            // A cooldown persisted by a previous run survives the restart.
            blocked_until: policy.blocked_until,
            ..DomainState::default()
        });
        state.roll_day(now.with_timezone(&self.tz).date_naive());

        if state.applications_today >= policy.max_per_day {
            return Admission::Reject {
                reason: reasons::DAILY_CAP,
            };
        }

        // Collect every obstacle's horizon; the admission time is the max.
        let mut earliest: Option<DateTime<Utc>> = None;
        let mut push = |candidate: DateTime<Utc>| {
            earliest = Some(earliest.map_or(candidate, |e| e.max(candidate)));
        };
        if let Some(blocked_until) = state.blocked_until {
            if now < blocked_until {
                push(blocked_until);
            }
        }
        if let Some(last) = state.last_started_at {
            let next_ok = last + chrono::Duration::seconds(policy.min_interval_secs as i64);
            if now < next_ok {
                push(next_ok);
            }
        }
        if state.in_flight >= policy.max_concurrent {
            push(now + chrono::Duration::seconds(CONCURRENCY_RETRY_SECS));
        }
        if let Some(earliest) = earliest {
            return Admission::Defer { earliest };
        }

        state.in_flight += 1;
        state.last_started_at = Some(now);
        state.applications_today += 1;

        let start_delay = if policy.jitter_max_secs == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(
                rand::thread_rng().gen_range(0..=policy.jitter_max_secs * 1000),
            )
        };
        Admission::Admit { start_delay }
    }

    /// Releases an in-flight slot.
    ///
    /// For `ReleaseOutcome::Blocked` the cooldown is applied and the new
    /// `blocked_until` deadline is returned so the caller can emit the
    /// corresponding event.
    pub fn release(
        &self,
        domain: &str,
        outcome: ReleaseOutcome,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let cooldown = self.policy_for(domain).cooldown_secs;
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = states.entry(domain.to_string()).or_default();
        state.in_flight = state.in_flight.saturating_sub(1);
        if outcome == ReleaseOutcome::Blocked {
            let until = now + chrono::Duration::seconds(cooldown as i64);
            state.blocked_until = Some(until);
            return Some(until);
        }
        None
    }

    /// Resets every domain's daily counter. Called at local midnight.
    pub fn daily_reset(&self, now: DateTime<Utc>) {
        let today = now.with_timezone(&self.tz).date_naive();
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for state in states.values_mut() {
            state.day = Some(today);
            state.applications_today = 0;
        }
    }

    /// Seeds a domain's daily counter from event replay during recovery.
    pub fn seed_applications_today(&self, domain: &str, count: u32, now: DateTime<Utc>) {
        let today = now.with_timezone(&self.tz).date_naive();
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = states.entry(domain.to_string()).or_default();
        state.day = Some(today);
        state.applications_today = count;
    }

    /// Current in-flight count for `domain`.
    #[must_use]
    pub fn in_flight(&self, domain: &str) -> u32 {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(domain)
            .map_or(0, |s| s.in_flight)
    }

    /// Snapshot of every tracked domain, for status reporting.
    #[must_use]
    pub fn snapshot(&self) -> std::collections::BTreeMap<String, DomainSnapshot> {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(domain, s)| {
                (
                    domain.clone(),
                    DomainSnapshot {
                        applications_today: s.applications_today,
                        in_flight: s.in_flight,
                        blocked_until: s.blocked_until,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn governor(policy: DomainPolicy) -> RateGovernor {
        RateGovernor::new(FixedOffset::east_opt(0).unwrap(), policy, HashMap::new())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_900_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_admit_then_interval_defer() {
        let g = governor(DomainPolicy {
            min_interval_secs: 60,
            max_concurrent: 2,
            ..DomainPolicy::default()
        });
        assert!(matches!(g.try_acquire("a.com", at(0)), Admission::Admit { .. }));
        match g.try_acquire("a.com", at(10)) {
            Admission::Defer { earliest } => assert_eq!(earliest, at(60)),
            other => panic!("expected defer, got {other:?}"),
        }
        assert!(matches!(g.try_acquire("a.com", at(61)), Admission::Admit { .. }));
    }

    #[test]
    fn test_concurrency_defer_and_release() {
        let g = governor(DomainPolicy {
            min_interval_secs: 0,
            max_concurrent: 1,
            ..DomainPolicy::default()
        });
        assert!(matches!(g.try_acquire("a.com", at(0)), Admission::Admit { .. }));
        assert_eq!(g.in_flight("a.com"), 1);
        assert!(matches!(
            g.try_acquire("a.com", at(1)),
            Admission::Defer { .. }
        ));
        g.release("a.com", ReleaseOutcome::Submitted, at(2));
        assert_eq!(g.in_flight("a.com"), 0);
        assert!(matches!(g.try_acquire("a.com", at(3)), Admission::Admit { .. }));
    }

    #[test]
    fn test_daily_cap_rejects() {
        let g = governor(DomainPolicy {
            max_per_day: 2,
            min_interval_secs: 0,
            max_concurrent: 10,
            ..DomainPolicy::default()
        });
        assert!(matches!(g.try_acquire("a.com", at(0)), Admission::Admit { .. }));
        assert!(matches!(g.try_acquire("a.com", at(1)), Admission::Admit { .. }));
        assert!(matches!(
            g.try_acquire("a.com", at(2)),
            Admission::Reject {
                reason: reasons::DAILY_CAP
            }
        ));
    }

    #[test]
    fn test_avoid_rejects() {
        let g = governor(DomainPolicy {
            avoid: true,
            ..DomainPolicy::default()
        });
        assert!(matches!(
            g.try_acquire("a.com", at(0)),
            Admission::Reject {
                reason: reasons::AVOID_COMPANY
            }
        ));
    }

    #[test]
    fn test_blocked_cooldown() {
        let g = governor(DomainPolicy {
            min_interval_secs: 0,
            max_concurrent: 5,
            cooldown_secs: 1800,
            ..DomainPolicy::default()
        });
        assert!(matches!(g.try_acquire("a.com", at(0)), Admission::Admit { .. }));
        let until = g.release("a.com", ReleaseOutcome::Blocked, at(5)).unwrap();
        assert_eq!(until, at(5 + 1800));
        match g.try_acquire("a.com", at(10)) {
            Admission::Defer { earliest } => assert_eq!(earliest, until),
            other => panic!("expected defer, got {other:?}"),
        }
        assert!(matches!(
            g.try_acquire("a.com", at(5 + 1801)),
            Admission::Admit { .. }
        ));
    }

    #[test]
    fn test_day_rollover_resets_counter() {
        let g = governor(DomainPolicy {
            max_per_day: 1,
            min_interval_secs: 0,
            ..DomainPolicy::default()
        });
        assert!(matches!(g.try_acquire("a.com", at(0)), Admission::Admit { .. }));
        g.release("a.com", ReleaseOutcome::Submitted, at(1));
        assert!(matches!(
            g.try_acquire("a.com", at(2)),
            Admission::Reject { .. }
        ));
        // Next local day.
        assert!(matches!(
            g.try_acquire("a.com", at(86_400)),
            Admission::Admit { .. }
        ));
    }

    #[test]
    fn test_timezone_day_boundary() {
        // UTC+05:30: local midnight falls at 18:30 UTC.
        let g = RateGovernor::new(
            FixedOffset::east_opt(5 * 3600 + 1800).unwrap(),
            DomainPolicy {
                max_per_day: 1,
                min_interval_secs: 0,
                ..DomainPolicy::default()
            },
            HashMap::new(),
        );
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 18, 0, 0).unwrap();
        assert!(matches!(g.try_acquire("a.com", base), Admission::Admit { .. }));
        g.release("a.com", ReleaseOutcome::Submitted, base);
        // 18:10 UTC is still the same local day.
        assert!(matches!(
            g.try_acquire("a.com", base + chrono::Duration::minutes(10)),
            Admission::Reject { .. }
        ));
        // 18:40 UTC crossed local midnight.
        assert!(matches!(
            g.try_acquire("a.com", base + chrono::Duration::minutes(40)),
            Admission::Admit { .. }
        ));
    }

    #[test]
    fn test_racing_defers_non_decreasing() {
        let g = governor(DomainPolicy {
            min_interval_secs: 120,
            max_concurrent: 1,
            ..DomainPolicy::default()
        });
        assert!(matches!(g.try_acquire("a.com", at(0)), Admission::Admit { .. }));
        let Admission::Defer { earliest: e1 } = g.try_acquire("a.com", at(1)) else {
            panic!("expected defer");
        };
        let Admission::Defer { earliest: e2 } = g.try_acquire("a.com", at(2)) else {
            panic!("expected defer");
        };
        assert!(e2 >= e1);
    }

    #[test]
    fn test_domains_are_independent() {
        let g = governor(DomainPolicy {
            max_concurrent: 1,
            min_interval_secs: 600,
            ..DomainPolicy::default()
        });
        assert!(matches!(g.try_acquire("a.com", at(0)), Admission::Admit { .. }));
        assert!(matches!(g.try_acquire("b.com", at(0)), Admission::Admit { .. }));
    }
}
