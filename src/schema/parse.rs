//! Direct-validation parsers: literal user input → typed `FieldValue`.
//!
//! These are deliberately strict. Anything looser ("around 200k", "next
//! spring") is left to the AI-extraction capability.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;

use super::model::{FieldDefinition, FieldType, FieldValue};

static GROUPED_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(?:[.,]\d{3})+$").unwrap());
static PLAIN_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:[.,]\d+)?$").unwrap());
static PHONE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+?\d{7,15}$").unwrap());
static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]{2,}$").unwrap());

/// Accepted literal date layouts, ISO first, then day-first.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"];

/// Why a value was rejected. Reported back to the user as a re-prompt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("no value given")]
    Empty,

    #[error("not a valid {0}")]
    WrongType(FieldType),

    #[error("not one of the accepted options")]
    NotAnOption,

    #[error("must be at least {0} characters")]
    TooShort(usize),

    #[error("must be at most {0} characters")]
    TooLong(usize),

    #[error("must be at least {0}")]
    BelowMinimum(Decimal),

    #[error("must be at most {0}")]
    AboveMaximum(Decimal),

    #[error("does not have the expected format")]
    PatternMismatch,

    #[error("must not be in the past")]
    InPast,

    #[error("unknown field {0}")]
    UnknownField(String),
}

/// Parse raw user text as a value of the field's type.
pub fn parse_literal(def: &FieldDefinition, raw: &str) -> Result<FieldValue, ValidationError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ValidationError::Empty);
    }

    match def.field_type {
        FieldType::String => {
            if text.contains('\n') {
                return Err(ValidationError::WrongType(FieldType::String));
            }
            Ok(FieldValue::Text(text.to_string()))
        }
        FieldType::Number => parse_number(text)
            .map(FieldValue::Number)
            .ok_or(ValidationError::WrongType(FieldType::Number)),
        FieldType::Enum => match_option(def, text)
            .map(FieldValue::Choice)
            .ok_or(ValidationError::NotAnOption),
        FieldType::Date => parse_date(text)
            .map(FieldValue::Date)
            .ok_or(ValidationError::WrongType(FieldType::Date)),
        FieldType::Phone => normalize_phone(text)
            .map(FieldValue::Phone)
            .ok_or(ValidationError::WrongType(FieldType::Phone)),
        FieldType::Email => normalize_email(text)
            .map(FieldValue::Email)
            .ok_or(ValidationError::WrongType(FieldType::Email)),
    }
}

/// Coerce a candidate returned by the extraction capability.
///
/// Extraction output is already normalized, so JSON numbers are accepted for
/// number fields and everything else goes through the literal parsers.
pub fn coerce_candidate(
    def: &FieldDefinition,
    candidate: &serde_json::Value,
) -> Result<FieldValue, ValidationError> {
    match candidate {
        serde_json::Value::Null => Err(ValidationError::Empty),
        serde_json::Value::Number(n) if def.field_type == FieldType::Number => {
            Decimal::from_str(&n.to_string())
                .or_else(|_| Decimal::from_scientific(&n.to_string()))
                .map(FieldValue::Number)
                .map_err(|_| ValidationError::WrongType(FieldType::Number))
        }
        serde_json::Value::Number(n) => parse_literal(def, &n.to_string()),
        serde_json::Value::String(s) => parse_literal(def, s),
        serde_json::Value::Bool(b) => parse_literal(def, &b.to_string()),
        _ => Err(ValidationError::WrongType(def.field_type)),
    }
}

/// Parse a literal amount: `200000`, `200,000`, `200.000`, `$1,250.50`,
/// `200k`, `1.5m`.
pub fn parse_number(text: &str) -> Option<Decimal> {
    let mut body = text
        .trim()
        .trim_start_matches(['$', '€', '£'])
        .trim()
        .to_lowercase();

    let multiplier = if let Some(stripped) = body.strip_suffix('k') {
        body = stripped.trim_end().to_string();
        Decimal::from(1_000)
    } else if let Some(stripped) = body.strip_suffix('m') {
        body = stripped.trim_end().to_string();
        Decimal::from(1_000_000)
    } else {
        Decimal::ONE
    };

    let normalized = if GROUPED_NUMBER.is_match(&body) {
        // "1,250.50" style: grouped integer part followed by a decimal part
        body.replace([',', '.'], "")
    } else if let Some((int_part, frac)) = split_grouped_with_decimal(&body) {
        format!("{int_part}.{frac}")
    } else if PLAIN_NUMBER.is_match(&body) {
        body.replace(',', ".")
    } else {
        return None;
    };

    Decimal::from_str(&normalized)
        .ok()
        .and_then(|d| d.checked_mul(multiplier))
}

/// Handle `1,250.50` / `1.250,50`: grouped integer part plus a 1–2 digit
/// decimal part using the other separator.
fn split_grouped_with_decimal(body: &str) -> Option<(String, String)> {
    let sep_pos = body.rfind(['.', ','])?;
    let (int_part, rest) = body.split_at(sep_pos);
    let frac = &rest[1..];
    let decimal_sep = rest.chars().next()?;
    if frac.is_empty() || frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if !GROUPED_NUMBER.is_match(int_part) || int_part.contains(decimal_sep) {
        return None;
    }
    Some((int_part.replace([',', '.'], ""), frac.to_string()))
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text.trim(), fmt).ok())
}

/// Strip separators and validate: optional `+`, 7–15 digits.
pub fn normalize_phone(text: &str) -> Option<String> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    PHONE.is_match(&cleaned).then_some(cleaned)
}

pub fn normalize_email(text: &str) -> Option<String> {
    let lowered = text.trim().to_lowercase();
    EMAIL.is_match(&lowered).then_some(lowered)
}

/// Case-insensitive exact option match, or a 1-based index into the options.
fn match_option(def: &FieldDefinition, text: &str) -> Option<String> {
    let needle = text.trim().trim_end_matches(['.', '!']).to_lowercase();
    if let Some(opt) = def.options.iter().find(|o| o.to_lowercase() == needle) {
        return Some(opt.clone());
    }
    needle
        .parse::<usize>()
        .ok()
        .and_then(|i| i.checked_sub(1))
        .and_then(|i| def.options.get(i).cloned())
}
