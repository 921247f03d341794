//! Field definitions and typed field values.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// The value type a field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Enum,
    Date,
    Phone,
    Email,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Enum => "enum",
            Self::Date => "date",
            Self::Phone => "phone",
            Self::Email => "email",
        };
        write!(f, "{s}")
    }
}

/// Declarative validation rule applied to a parsed value.
///
/// Every constraint is optional; an empty rule accepts any value of the
/// field's type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Decimal>,
    /// Regex the textual form of the value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Dates must be today or later.
    #[serde(default)]
    pub not_in_past: bool,
}

/// Static description of one piece of information to collect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub key: String,
    /// Question shown to the user when this field is pending.
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub validator: ValidationRule,
    /// Keys that must be satisfied before this field is asked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Accepted options for `enum` fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Short description given to the extraction model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldDefinition {
    pub fn new(key: impl Into<String>, label: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            field_type,
            required: false,
            validator: ValidationRule::default(),
            depends_on: Vec::new(),
            options: Vec::new(),
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn depends_on(mut self, keys: &[&str]) -> Self {
        self.depends_on = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    pub fn with_validator(mut self, validator: ValidationRule) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A typed value collected for a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(Decimal),
    Choice(String),
    Date(NaiveDate),
    Phone(String),
    Email(String),
}

impl FieldValue {
    /// Plain JSON rendering used for downstream records and prompts.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Number(n) => {
                match n.fract().is_zero().then(|| n.to_i64()).flatten() {
                    Some(whole) => serde_json::Value::from(whole),
                    None => serde_json::Value::String(n.normalize().to_string()),
                }
            }
            other => serde_json::Value::String(other.to_string()),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(s) | Self::Choice(s) | Self::Phone(s) | Self::Email(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{}", n.normalize()),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}
