//! Question records: one form-field interaction captured for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ApplicationId, StateError};

/// Where a filled value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    /// Taken verbatim from the user profile.
    Profile,
    /// Generated by a model call.
    Llm,
    /// The form's own default.
    Default,
    /// A canned template.
    Template,
    /// Entered by a human during intervention.
    Manual,
}

impl ValueSource {
    /// Parses a source from its stable string form.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnknownValueSource` for unrecognized strings.
    pub fn parse(s: &str) -> Result<Self, StateError> {
        match s {
            "profile" => Ok(Self::Profile),
            "llm" => Ok(Self::Llm),
            "default" => Ok(Self::Default),
            "template" => Ok(Self::Template),
            "manual" => Ok(Self::Manual),
            _ => Err(StateError::UnknownValueSource(s.to_string())),
        }
    }

    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Llm => "llm",
            Self::Default => "default",
            Self::Template => "template",
            Self::Manual => "manual",
        }
    }
}

/// Descriptor of one form field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field widget type, e.g. `text`, `select`, `file`.
    pub field_type: String,
    /// Normalized label used for matching.
    pub label: String,
    /// Label exactly as it appeared on the page.
    pub raw_label: String,
    /// Whether the form marked the field required.
    pub required: bool,
}

/// One answered field, keyed by `(application, step_index)`.
///
/// `step_index` is assigned by the repository and is strictly increasing
/// per application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    /// Owning application.
    pub application_id: ApplicationId,
    /// Strictly increasing ordinal within the application.
    pub step_index: u32,
    /// The field that was filled.
    pub field: FieldDescriptor,
    /// The value that was entered.
    pub value: String,
    /// Where the value came from.
    pub source: ValueSource,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Validation error surfaced by the form, if any.
    pub validation_error: Option<String>,
    /// Corrected value, if a correction was applied.
    pub correction: Option<String>,
    /// Who applied the correction.
    pub corrected_by: Option<String>,
    /// Capture time.
    pub at: DateTime<Utc>,
}
