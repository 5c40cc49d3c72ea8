//! Configuration file formats and the session config snapshot.

use std::collections::HashMap;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::governor::DomainPolicy;
use crate::model::SessionLimits;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A config file is not valid JSON for its schema.
    #[error("malformed config: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The timezone string is not `UTC` or a `±HH:MM` offset.
    #[error("invalid timezone '{0}': expected 'UTC' or '±HH:MM'")]
    InvalidTimezone(String),
}

/// Session configuration supplied at creation and frozen into the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum attempted items.
    pub max_items: u32,
    /// Maximum wall-clock duration in seconds.
    pub max_duration_secs: u64,
    /// Maximum concurrent workers.
    pub max_concurrency: u32,
    /// Cost budget in dollars.
    pub budget_cost: f64,
    /// Session timezone: `UTC` or a fixed `±HH:MM` offset.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Reference to the effort policy in force, recorded for audit.
    #[serde(default)]
    pub effort_policy_ref: Option<String>,
    /// Reference to the stealth policy in force, recorded for audit.
    #[serde(default)]
    pub stealth_policy_ref: Option<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_items: 25,
            max_duration_secs: 4 * 3600,
            max_concurrency: 5,
            budget_cost: 5.0,
            timezone: default_timezone(),
            effort_policy_ref: None,
            stealth_policy_ref: None,
        }
    }
}

impl SessionConfig {
    /// Hard limits derived from this config.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            max_items: self.max_items,
            max_duration_secs: self.max_duration_secs,
            max_concurrency: self.max_concurrency,
            budget_micros: (self.budget_cost.max(0.0) * 1_000_000.0).round() as u64,
        }
    }

    /// Parses the configured timezone into a fixed offset.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidTimezone` for anything other than
    /// `UTC` or `±HH:MM`.
    pub fn tz_offset(&self) -> Result<FixedOffset, ConfigError> {
        parse_offset(&self.timezone)
    }
}

/// Parses `UTC` or `±HH:MM` into a fixed offset.
///
/// # Errors
///
/// Returns `ConfigError::InvalidTimezone` on malformed input.
pub fn parse_offset(s: &str) -> Result<FixedOffset, ConfigError> {
    if s.eq_ignore_ascii_case("utc") || s == "Z" || s == "+00:00" {
        return FixedOffset::east_opt(0).ok_or_else(|| ConfigError::InvalidTimezone(s.into()));
    }
    let bad = || ConfigError::InvalidTimezone(s.to_string());
    let (sign, rest) = if let Some(rest) = s.strip_prefix('+') {
        (1i32, rest)
    } else if let Some(rest) = s.strip_prefix('-') {
        (-1i32, rest)
    } else {
        return Err(bad());
    };
    let (hh, mm) = rest.split_once(':').ok_or_else(bad)?;
    let hours: i32 = hh.parse().map_err(|_| bad())?;
    let minutes: i32 = mm.parse().map_err(|_| bad())?;
    if hours > 14 || minutes > 59 {
        return Err(bad());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}

/// Stealth / domain policy file: a default policy plus per-domain entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StealthConfig {
    /// Applied to domains with no explicit entry.
    #[serde(default)]
    pub default: DomainPolicy,
    /// Per-domain overrides keyed by canonical host.
    #[serde(default)]
    pub domains: HashMap<String, DomainPolicy>,
}

impl StealthConfig {
    /// Parses a stealth config from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Malformed` when the JSON does not match the
    /// schema.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Ground-truth skill lists consumed by the QA gate as a read-only
/// reference. The content generator owns interpretation; the core only
/// carries the data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileTruth {
    /// Skills the user verifiably has.
    #[serde(default)]
    pub skills_true: Vec<String>,
    /// Skills the user must never be claimed to have.
    #[serde(default)]
    pub skills_false: Vec<String>,
}

impl ProfileTruth {
    /// Parses a profile-truth file from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Malformed` when the JSON does not match the
    /// schema.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset("+02:00").unwrap().local_minus_utc(), 7200);
        assert_eq!(
            parse_offset("-05:30").unwrap().local_minus_utc(),
            -(5 * 3600 + 1800)
        );
        assert!(parse_offset("PST").is_err());
        assert!(parse_offset("+25:00").is_err());
        assert!(parse_offset("02:00").is_err());
    }

    #[test]
    fn test_limits_conversion() {
        let cfg = SessionConfig {
            budget_cost: 1.5,
            ..SessionConfig::default()
        };
        assert_eq!(cfg.limits().budget_micros, 1_500_000);
    }

    #[test]
    fn test_stealth_config_defaults() {
        let cfg = StealthConfig::from_json(
            r#"{
                "default": { "max_per_day": 10 },
                "domains": {
                    "linkedin.com": { "max_per_day": 5, "min_interval_secs": 300, "avoid": false },
                    "spam.example.com": { "avoid": true }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.default.max_per_day, 10);
        assert_eq!(cfg.domains["linkedin.com"].min_interval_secs, 300);
        assert!(cfg.domains["spam.example.com"].avoid);
        // Unspecified fields fall back to policy defaults.
        assert_eq!(cfg.domains["spam.example.com"].max_concurrent, 1);
    }
}
