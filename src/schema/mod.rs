//! Field schema — the static set of fields a conversation collects.
//!
//! Loaded once at startup (built-in real-estate lead schema, or a JSON file)
//! and validated so the dialogue can never dead-end: dependencies exist, form
//! no cycle, and required fields only depend on other required fields.

pub mod model;
pub mod parse;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;

use crate::error::SchemaError;

pub use model::{FieldDefinition, FieldType, FieldValue, ValidationRule};
pub use parse::ValidationError;

/// Validated, immutable field schema.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    fields: Vec<FieldDefinition>,
    patterns: HashMap<String, Regex>,
}

impl FieldSchema {
    /// Build a schema, checking every structural invariant.
    pub fn new(fields: Vec<FieldDefinition>) -> Result<Self, SchemaError> {
        if fields.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut seen = HashSet::new();
        for f in &fields {
            if f.key.trim().is_empty() {
                return Err(SchemaError::EmptyKey);
            }
            if !seen.insert(f.key.as_str()) {
                return Err(SchemaError::DuplicateKey(f.key.clone()));
            }
            if f.field_type == FieldType::Enum && f.options.is_empty() {
                return Err(SchemaError::EmptyOptions(f.key.clone()));
            }
        }

        let by_key: HashMap<&str, &FieldDefinition> =
            fields.iter().map(|f| (f.key.as_str(), f)).collect();
        for f in &fields {
            for dep in &f.depends_on {
                let Some(target) = by_key.get(dep.as_str()) else {
                    return Err(SchemaError::UnknownDependency {
                        field: f.key.clone(),
                        dependency: dep.clone(),
                    });
                };
                if f.required && !target.required {
                    return Err(SchemaError::RequiredOnOptional {
                        field: f.key.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        detect_cycles(&by_key)?;

        let mut patterns = HashMap::new();
        for f in &fields {
            if let Some(ref pattern) = f.validator.pattern {
                let re = Regex::new(pattern).map_err(|e| SchemaError::InvalidPattern {
                    field: f.key.clone(),
                    reason: e.to_string(),
                })?;
                patterns.insert(f.key.clone(), re);
            }
        }

        Ok(Self { fields, patterns })
    }

    /// Parse a JSON array of field definitions.
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let fields: Vec<FieldDefinition> =
            serde_json::from_str(json).map_err(|e| SchemaError::Parse(e.to_string()))?;
        Self::new(fields)
    }

    /// Load a schema file from disk.
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let json = std::fs::read_to_string(path)?;
        let schema = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), fields = schema.len(), "Field schema loaded");
        Ok(schema)
    }

    /// Built-in schema for real-estate lead intake.
    pub fn real_estate() -> Self {
        let fields = vec![
            FieldDefinition::new("name", "To get started, what's your name?", FieldType::String)
                .required()
                .with_validator(ValidationRule {
                    min_length: Some(2),
                    max_length: Some(80),
                    ..Default::default()
                })
                .with_description("The person's name"),
            FieldDefinition::new("operation", "Are you looking to buy or to rent?", FieldType::Enum)
                .required()
                .with_options(&["buy", "rent"])
                .with_description("Whether the person wants to buy or rent"),
            FieldDefinition::new(
                "property_type",
                "What kind of property are you after: apartment, house, land or commercial?",
                FieldType::Enum,
            )
            .required()
            .depends_on(&["operation"])
            .with_options(&["apartment", "house", "land", "commercial"]),
            FieldDefinition::new(
                "location",
                "Which area or neighborhood are you interested in?",
                FieldType::String,
            )
            .required()
            .with_validator(ValidationRule {
                min_length: Some(2),
                max_length: Some(120),
                ..Default::default()
            })
            .with_description("Preferred city, area or neighborhood"),
            FieldDefinition::new("budget", "What's your approximate budget?", FieldType::Number)
                .required()
                .depends_on(&["operation"])
                .with_validator(ValidationRule {
                    min: Some(Decimal::ONE),
                    ..Default::default()
                })
                .with_description("Maximum budget as a plain number (monthly rent when renting)"),
            FieldDefinition::new(
                "phone",
                "What's the best phone number to reach you?",
                FieldType::Phone,
            )
            .required(),
            FieldDefinition::new("email", "What's your email address?", FieldType::Email),
            FieldDefinition::new("move_date", "When would you like to move?", FieldType::Date)
                .with_validator(ValidationRule {
                    not_in_past: true,
                    ..Default::default()
                })
                .with_description("Desired move-in date, ISO formatted"),
        ];
        // The built-in definitions satisfy every invariant checked by `new`.
        Self {
            fields,
            patterns: HashMap::new(),
        }
    }

    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Required fields in declaration order.
    pub fn required(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.required)
    }

    /// Parse literal user input for `key` and apply its validation rule.
    pub fn parse_input(
        &self,
        key: &str,
        raw: &str,
        today: NaiveDate,
    ) -> Result<FieldValue, ValidationError> {
        let def = self
            .get(key)
            .ok_or_else(|| ValidationError::UnknownField(key.to_string()))?;
        let value = parse::parse_literal(def, raw)?;
        self.check_rule(def, &value, today)?;
        Ok(value)
    }

    /// Coerce an extraction candidate for `key` and apply its validation rule.
    pub fn coerce_candidate(
        &self,
        key: &str,
        candidate: &serde_json::Value,
        today: NaiveDate,
    ) -> Result<FieldValue, ValidationError> {
        let def = self
            .get(key)
            .ok_or_else(|| ValidationError::UnknownField(key.to_string()))?;
        let value = parse::coerce_candidate(def, candidate)?;
        self.check_rule(def, &value, today)?;
        Ok(value)
    }

    fn check_rule(
        &self,
        def: &FieldDefinition,
        value: &FieldValue,
        today: NaiveDate,
    ) -> Result<(), ValidationError> {
        let rule = &def.validator;
        let text = value.to_string();
        let chars = text.chars().count();

        if let Some(min) = rule.min_length
            && chars < min
        {
            return Err(ValidationError::TooShort(min));
        }
        if let Some(max) = rule.max_length
            && chars > max
        {
            return Err(ValidationError::TooLong(max));
        }
        if let FieldValue::Number(n) = value {
            if let Some(min) = rule.min
                && *n < min
            {
                return Err(ValidationError::BelowMinimum(min));
            }
            if let Some(max) = rule.max
                && *n > max
            {
                return Err(ValidationError::AboveMaximum(max));
            }
        }
        if let FieldValue::Date(d) = value
            && rule.not_in_past
            && *d < today
        {
            return Err(ValidationError::InPast);
        }
        if let Some(re) = self.patterns.get(&def.key)
            && !re.is_match(&text)
        {
            return Err(ValidationError::PatternMismatch);
        }
        Ok(())
    }
}

/// Depth-first search over `depends_on` edges.
fn detect_cycles(by_key: &HashMap<&str, &FieldDefinition>) -> Result<(), SchemaError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        key: &'a str,
        by_key: &HashMap<&'a str, &'a FieldDefinition>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), SchemaError> {
        match marks.get(key) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(SchemaError::DependencyCycle(key.to_string())),
            None => {}
        }
        marks.insert(key, Mark::Visiting);
        if let Some(&def) = by_key.get(key) {
            for dep in &def.depends_on {
                visit(dep.as_str(), by_key, marks)?;
            }
        }
        marks.insert(key, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for key in by_key.keys() {
        visit(key, by_key, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
    }

    #[test]
    fn built_in_schema_passes_validation() {
        let builtin = FieldSchema::real_estate();
        let rebuilt = FieldSchema::new(builtin.fields().to_vec());
        assert!(rebuilt.is_ok(), "{rebuilt:?}");
        assert_eq!(builtin.required().count(), 6);
    }

    #[test]
    fn rejects_duplicate_keys() {
        let fields = vec![
            FieldDefinition::new("a", "A?", FieldType::String),
            FieldDefinition::new("a", "A again?", FieldType::String),
        ];
        assert!(matches!(
            FieldSchema::new(fields),
            Err(SchemaError::DuplicateKey(k)) if k == "a"
        ));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let fields = vec![FieldDefinition::new("a", "A?", FieldType::String).depends_on(&["zzz"])];
        assert!(matches!(
            FieldSchema::new(fields),
            Err(SchemaError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn rejects_dependency_cycle() {
        let fields = vec![
            FieldDefinition::new("a", "A?", FieldType::String).depends_on(&["b"]),
            FieldDefinition::new("b", "B?", FieldType::String).depends_on(&["a"]),
        ];
        assert!(matches!(
            FieldSchema::new(fields),
            Err(SchemaError::DependencyCycle(_))
        ));
    }

    #[test]
    fn rejects_required_depending_on_optional() {
        let fields = vec![
            FieldDefinition::new("a", "A?", FieldType::String),
            FieldDefinition::new("b", "B?", FieldType::String)
                .required()
                .depends_on(&["a"]),
        ];
        assert!(matches!(
            FieldSchema::new(fields),
            Err(SchemaError::RequiredOnOptional { .. })
        ));
    }

    #[test]
    fn rejects_enum_without_options_and_bad_pattern() {
        let fields = vec![FieldDefinition::new("a", "A?", FieldType::Enum)];
        assert!(matches!(FieldSchema::new(fields), Err(SchemaError::EmptyOptions(_))));

        let fields = vec![FieldDefinition::new("a", "A?", FieldType::String).with_validator(
            ValidationRule {
                pattern: Some("(".into()),
                ..Default::default()
            },
        )];
        assert!(matches!(
            FieldSchema::new(fields),
            Err(SchemaError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn from_json_parses_definitions() {
        let schema = FieldSchema::from_json(
            r#"[
                {"key": "name", "label": "Name?", "type": "string", "required": true},
                {"key": "budget", "label": "Budget?", "type": "number", "required": true,
                 "depends_on": ["name"]}
            ]"#,
        )
        .unwrap();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.get("budget").unwrap().depends_on, vec!["name"]);
    }

    #[test]
    fn parse_input_applies_rules() {
        let schema = FieldSchema::real_estate();
        assert_eq!(
            schema.parse_input("name", "M", today()),
            Err(ValidationError::TooShort(2))
        );
        assert_eq!(
            schema.parse_input("budget", "0", today()),
            Err(ValidationError::BelowMinimum(Decimal::ONE))
        );
        assert_eq!(
            schema.parse_input("budget", "250000", today()),
            Ok(FieldValue::Number(dec!(250000)))
        );
        assert_eq!(
            schema.parse_input("move_date", "2020-01-01", today()),
            Err(ValidationError::InPast)
        );
        assert!(schema.parse_input("move_date", "2027-01-01", today()).is_ok());
        assert_eq!(
            schema.parse_input("nope", "x", today()),
            Err(ValidationError::UnknownField("nope".into()))
        );
    }

    #[test]
    fn pattern_rule_is_enforced() {
        let schema = FieldSchema::new(vec![
            FieldDefinition::new("zip", "Zip?", FieldType::String).with_validator(
                ValidationRule {
                    pattern: Some(r"^\d{5}$".into()),
                    ..Default::default()
                },
            ),
        ])
        .unwrap();
        assert!(schema.parse_input("zip", "28001", today()).is_ok());
        assert_eq!(
            schema.parse_input("zip", "280", today()),
            Err(ValidationError::PatternMismatch)
        );
    }
}
