//! Policy-driven effort selection.
//!
//! The evaluator is a pure function over a frozen variable map: given the
//! caller's effort hint, the match score, the company tier, and the target
//! domain's policy, it returns the final effort level, whether a QA pass is
//! required, and an optional skip reason. No I/O, no clock, no randomness;
//! the same inputs always produce the same decision, and rule tie-breaks are
//! resolved by declared order.
//!
//! Rules are declared in four ordered lists — skip guards are built in,
//! then upgrades, downgrades, and QA triggers — each rule carrying a
//! predicate in the restricted expression language of [`expr`]. A predicate
//! that fails to parse disables its rule with a single load-time warning; a
//! predicate referencing an unknown identifier rejects the whole policy at
//! load. Evaluation itself never fails.

pub mod expr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::governor::DomainPolicy;
use crate::model::{reasons, CompanyTier, Effort};
use expr::{base_context, Context, Expr, Value};

/// Default match-score skip threshold.
const DEFAULT_SKIP_THRESHOLD: f64 = 0.20;

/// Variables every predicate may reference, beyond named thresholds.
const ALLOWED_VARS: &[&str] = &[
    "hint_effort",
    "match_score",
    "company_tier",
    "domain_avoid",
    "domain_max_per_day",
    "domain_min_interval_secs",
    "domain_max_concurrent",
    "true",
    "false",
];

/// Per-item signals handed to the evaluator.
#[derive(Debug, Clone)]
pub struct Signals<'a> {
    /// Caller's suggested effort.
    pub hint_effort: Effort,
    /// Semantic match score in `[0, 1]`.
    pub match_score: f64,
    /// Company tier.
    pub company_tier: CompanyTier,
    /// Policy of the item's target domain, when loaded.
    pub domain_policy: Option<&'a DomainPolicy>,
}

/// The evaluator's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Final effort level.
    pub effort: Effort,
    /// Whether a QA pass must run after form fill.
    pub qa_required: bool,
    /// Skip reason; when set, the item is not dispatched.
    pub skip_reason: Option<String>,
    /// Human-readable rationale from the matched rule, for audit.
    pub rationale: Option<String>,
}

impl Decision {
    fn skip(reason: &str) -> Self {
        Self {
            effort: Effort::Low,
            qa_required: false,
            skip_reason: Some(reason.to_string()),
            rationale: None,
        }
    }
}

/// One declarative rule: a predicate and a target effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Predicate in the restricted expression language.
    pub when: String,
    /// Target effort (`upgrade_rules` raise to it, `downgrade_rules` lower
    /// to it). Absent for QA rules.
    #[serde(default)]
    pub to: Option<Effort>,
    /// Optional audit rationale.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Per-effort cost ceilings in dollars, used by the dispatcher's budget
/// guard before admission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostCeilings {
    /// Ceiling for low-effort items.
    pub low: f64,
    /// Ceiling for medium-effort items.
    pub medium: f64,
    /// Ceiling for high-effort items.
    pub high: f64,
}

impl Default for CostCeilings {
    fn default() -> Self {
        Self {
            low: 0.02,
            medium: 0.10,
            high: 0.50,
        }
    }
}

impl CostCeilings {
    /// Ceiling for one effort level, in micro-dollars.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn micros(&self, effort: Effort) -> u64 {
        let dollars = match effort {
            Effort::Low => self.low,
            Effort::Medium => self.medium,
            Effort::High => self.high,
        };
        (dollars.max(0.0) * 1_000_000.0).round() as u64
    }
}

/// Effort policy as it appears on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EffortPolicyFile {
    /// Match-score floor below which items are skipped.
    #[serde(default)]
    pub skip_threshold: Option<f64>,
    /// Named numeric constants usable in predicates, e.g. `high_match`.
    #[serde(default)]
    pub thresholds: std::collections::BTreeMap<String, f64>,
    /// Ordered upgrade rules; first match wins.
    #[serde(default)]
    pub upgrade_rules: Vec<RuleSpec>,
    /// Ordered downgrade rules; first match wins.
    #[serde(default)]
    pub downgrade_rules: Vec<RuleSpec>,
    /// QA triggers; any match sets `qa_required`.
    #[serde(default)]
    pub qa_rules: Vec<RuleSpec>,
    /// Per-effort cost ceilings.
    #[serde(default)]
    pub cost_ceilings: CostCeilings,
}

/// Policy load errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The file is not valid JSON for the policy schema.
    #[error("malformed effort policy: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A predicate references an identifier outside the variable set.
    #[error("rule {phase}[{index}] references unknown identifier '{name}'")]
    UnknownIdentifier {
        /// Rule list name.
        phase: &'static str,
        /// Rule position within its list.
        index: usize,
        /// The unknown identifier.
        name: String,
    },

    /// An upgrade or downgrade rule is missing its target effort.
    #[error("rule {phase}[{index}] has no target effort")]
    MissingTarget {
        /// Rule list name.
        phase: &'static str,
        /// Rule position within its list.
        index: usize,
    },

    /// The skip threshold is outside `[0, 1]`.
    #[error("skip threshold {0} is outside [0, 1]")]
    BadThreshold(f64),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    predicate: Expr,
    target: Option<Effort>,
    rationale: Option<String>,
}

/// A validated, compiled effort policy ready for evaluation.
#[derive(Debug, Clone)]
pub struct LoadedEffortPolicy {
    skip_threshold: f64,
    thresholds: std::collections::BTreeMap<String, f64>,
    upgrade: Vec<CompiledRule>,
    downgrade: Vec<CompiledRule>,
    qa: Vec<CompiledRule>,
    ceilings: CostCeilings,
}

impl Default for LoadedEffortPolicy {
    fn default() -> Self {
        EffortPolicyFile::default()
            .compile()
            .unwrap_or_else(|_| unreachable!("empty policy always compiles"))
    }
}

impl EffortPolicyFile {
    /// Parses a policy from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError::Malformed` when the JSON does not match the
    /// schema.
    pub fn from_json(text: &str) -> Result<Self, PolicyError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Compiles and validates the policy.
    ///
    /// Predicates that fail to parse disable their rule (logged once here);
    /// unknown identifiers and missing rule targets reject the policy.
    ///
    /// # Errors
    ///
    /// Returns a `PolicyError` describing the first structural problem.
    pub fn compile(self) -> Result<LoadedEffortPolicy, PolicyError> {
        let skip_threshold = self.skip_threshold.unwrap_or(DEFAULT_SKIP_THRESHOLD);
        if !(0.0..=1.0).contains(&skip_threshold) {
            return Err(PolicyError::BadThreshold(skip_threshold));
        }

        let compile_list = |phase: &'static str,
                            rules: &[RuleSpec],
                            need_target: bool,
                            thresholds: &std::collections::BTreeMap<String, f64>|
         -> Result<Vec<CompiledRule>, PolicyError> {
            let mut out = Vec::with_capacity(rules.len());
            for (index, rule) in rules.iter().enumerate() {
                if need_target && rule.to.is_none() {
                    return Err(PolicyError::MissingTarget { phase, index });
                }
                let predicate = match Expr::parse(&rule.when) {
                    Ok(expr) => expr,
                    Err(err) => {
                        warn!(
                            phase,
                            index,
                            predicate = %rule.when,
                            %err,
                            "disabling effort rule with unparseable predicate"
                        );
                        continue;
                    }
                };
                for name in predicate.identifiers() {
                    let known = ALLOWED_VARS.contains(&name.as_str())
                        || thresholds.contains_key(&name);
                    if !known {
                        return Err(PolicyError::UnknownIdentifier { phase, index, name });
                    }
                }
                out.push(CompiledRule {
                    predicate,
                    target: rule.to,
                    rationale: rule.reason.clone(),
                });
            }
            Ok(out)
        };

        Ok(LoadedEffortPolicy {
            upgrade: compile_list("upgrade_rules", &self.upgrade_rules, true, &self.thresholds)?,
            downgrade: compile_list(
                "downgrade_rules",
                &self.downgrade_rules,
                true,
                &self.thresholds,
            )?,
            qa: compile_list("qa_rules", &self.qa_rules, false, &self.thresholds)?,
            skip_threshold,
            thresholds: self.thresholds,
            ceilings: self.cost_ceilings,
        })
    }
}

impl LoadedEffortPolicy {
    /// Per-effort cost ceilings.
    #[must_use]
    pub const fn ceilings(&self) -> &CostCeilings {
        &self.ceilings
    }

    /// The configured skip threshold.
    #[must_use]
    pub const fn skip_threshold(&self) -> f64 {
        self.skip_threshold
    }

    /// Evaluates the policy for one item.
    ///
    /// Phases run in fixed order: built-in skip guards, upgrades (first
    /// match raises, never lowers), downgrades (first match lowers, never
    /// raises), then QA triggers against the final effort. A predicate
    /// evaluation error counts as a non-match.
    #[must_use]
    pub fn evaluate(&self, signals: &Signals<'_>) -> Decision {
        if signals.company_tier == CompanyTier::Avoid {
            return Decision::skip(reasons::AVOID_COMPANY);
        }
        if signals.match_score < self.skip_threshold {
            return Decision::skip(reasons::LOW_MATCH);
        }

        let ctx = self.context(signals);
        let mut effort = signals.hint_effort;
        let mut rationale = None;

        if let Some(rule) = first_match(&self.upgrade, &ctx) {
            if let Some(target) = rule.target {
                if target > effort {
                    effort = target;
                    rationale.clone_from(&rule.rationale);
                }
            }
        }
        if let Some(rule) = first_match(&self.downgrade, &ctx) {
            if let Some(target) = rule.target {
                if target < effort {
                    effort = target;
                    rationale.clone_from(&rule.rationale);
                }
            }
        }

        let qa_required = self
            .qa
            .iter()
            .any(|rule| rule.predicate.eval(&ctx).unwrap_or_else(|err| {
                debug!(%err, "qa predicate evaluation failed; treating as false");
                false
            }));

        Decision {
            effort,
            qa_required,
            skip_reason: None,
            rationale,
        }
    }

    fn context(&self, signals: &Signals<'_>) -> Context {
        let mut ctx = base_context();
        ctx.insert(
            "hint_effort".to_string(),
            Value::Text(signals.hint_effort.as_str().to_string()),
        );
        ctx.insert(
            "match_score".to_string(),
            Value::Number(signals.match_score),
        );
        ctx.insert(
            "company_tier".to_string(),
            Value::Text(signals.company_tier.as_str().to_string()),
        );
        let (avoid, per_day, interval, concurrent) = signals.domain_policy.map_or(
            (false, f64::INFINITY, 0.0, f64::INFINITY),
            |p| {
                (
                    p.avoid,
                    f64::from(p.max_per_day),
                    p.min_interval_secs as f64,
                    f64::from(p.max_concurrent),
                )
            },
        );
        ctx.insert("domain_avoid".to_string(), Value::Bool(avoid));
        ctx.insert("domain_max_per_day".to_string(), Value::Number(per_day));
        ctx.insert(
            "domain_min_interval_secs".to_string(),
            Value::Number(interval),
        );
        ctx.insert(
            "domain_max_concurrent".to_string(),
            Value::Number(concurrent),
        );
        for (name, value) in &self.thresholds {
            ctx.insert(name.clone(), Value::Number(*value));
        }
        ctx
    }
}

fn first_match<'a>(rules: &'a [CompiledRule], ctx: &Context) -> Option<&'a CompiledRule> {
    rules.iter().find(|rule| {
        rule.predicate.eval(ctx).unwrap_or_else(|err| {
            debug!(%err, "predicate evaluation failed; treating as false");
            false
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LoadedEffortPolicy {
        EffortPolicyFile::from_json(
            r#"{
                "skip_threshold": 0.20,
                "thresholds": { "high_match": 0.85, "weak_match": 0.35 },
                "upgrade_rules": [
                    { "when": "match_score >= high_match", "to": "high", "reason": "strong match" },
                    { "when": "company_tier == 'top'", "to": "high", "reason": "top tier" }
                ],
                "downgrade_rules": [
                    { "when": "match_score < weak_match", "to": "low", "reason": "weak match" }
                ],
                "qa_rules": [
                    { "when": "hint_effort == 'high' or match_score >= high_match" }
                ],
                "cost_ceilings": { "low": 0.02, "medium": 0.10, "high": 0.50 }
            }"#,
        )
        .unwrap()
        .compile()
        .unwrap()
    }

    fn signals(hint: Effort, score: f64, tier: CompanyTier) -> Signals<'static> {
        Signals {
            hint_effort: hint,
            match_score: score,
            company_tier: tier,
            domain_policy: None,
        }
    }

    #[test]
    fn test_avoid_tier_skips() {
        let d = policy().evaluate(&signals(Effort::High, 0.95, CompanyTier::Avoid));
        assert_eq!(d.skip_reason.as_deref(), Some(reasons::AVOID_COMPANY));
        assert_eq!(d.effort, Effort::Low);
        assert!(!d.qa_required);
    }

    #[test]
    fn test_low_match_skips() {
        let d = policy().evaluate(&signals(Effort::Medium, 0.15, CompanyTier::Normal));
        assert_eq!(d.skip_reason.as_deref(), Some(reasons::LOW_MATCH));
    }

    #[test]
    fn test_upgrade_first_match_wins() {
        // Both upgrade rules match; the first (strong match) supplies the
        // rationale, deterministically.
        let d = policy().evaluate(&signals(Effort::Medium, 0.90, CompanyTier::Top));
        assert_eq!(d.effort, Effort::High);
        assert_eq!(d.rationale.as_deref(), Some("strong match"));
        assert!(d.qa_required);
    }

    #[test]
    fn test_upgrade_never_downgrades() {
        // Hint is already high; a rule targeting high cannot lower anything,
        // and the downgrade phase is what would lower it.
        let d = policy().evaluate(&signals(Effort::High, 0.60, CompanyTier::Normal));
        assert_eq!(d.effort, Effort::High);
    }

    #[test]
    fn test_downgrade_lowers() {
        let d = policy().evaluate(&signals(Effort::Medium, 0.25, CompanyTier::Normal));
        assert_eq!(d.effort, Effort::Low);
        assert_eq!(d.rationale.as_deref(), Some("weak match"));
    }

    #[test]
    fn test_determinism() {
        let p = policy();
        let s = signals(Effort::Medium, 0.87, CompanyTier::Top);
        let first = p.evaluate(&s);
        for _ in 0..32 {
            assert_eq!(p.evaluate(&s), first);
        }
    }

    #[test]
    fn test_unparseable_predicate_disables_rule() {
        let p = EffortPolicyFile::from_json(
            r#"{
                "upgrade_rules": [
                    { "when": "match_score >>> 2", "to": "high" },
                    { "when": "match_score >= 0.5", "to": "high" }
                ]
            }"#,
        )
        .unwrap()
        .compile()
        .unwrap();
        // The broken rule is gone; the well-formed one still applies.
        let d = p.evaluate(&signals(Effort::Low, 0.6, CompanyTier::Normal));
        assert_eq!(d.effort, Effort::High);
    }

    #[test]
    fn test_unknown_identifier_rejected_at_load() {
        let err = EffortPolicyFile::from_json(
            r#"{ "upgrade_rules": [ { "when": "moon_phase == 'full'", "to": "high" } ] }"#,
        )
        .unwrap()
        .compile()
        .unwrap_err();
        assert!(matches!(err, PolicyError::UnknownIdentifier { .. }));
    }

    #[test]
    fn test_ceiling_micros() {
        let c = CostCeilings::default();
        assert_eq!(c.micros(Effort::Low), 20_000);
        assert_eq!(c.micros(Effort::Medium), 100_000);
        assert_eq!(c.micros(Effort::High), 500_000);
    }
}
