//! User-facing reply templates.

use super::model::{ConversationState, ConversationStatus};
use crate::schema::{FieldDefinition, FieldSchema, FieldType, FieldValue, ValidationError};

pub const WELCOME: &str =
    "Hi! I'm the virtual assistant of the agency. I'll ask a few quick questions so one of our agents can help you.";

pub const RETRIEVAL_FALLBACK: &str =
    "Sorry, I can't look that up right now. An agent will follow up on your question.";

pub const COMPLETED_REPLY: &str =
    "Your request is already with our team. An agent will contact you shortly.";

pub const ABANDONED_REPLY: &str =
    "This conversation was closed after a period of inactivity. Please contact the agency to start a new request.";

pub const RESTARTED: &str = "No problem, let's start over.";

/// Human name for a field key: `property_type` → `property type`.
pub fn field_name(key: &str) -> String {
    key.replace('_', " ")
}

/// Format hint appended to a re-prompt.
pub fn type_hint(field: &FieldDefinition) -> String {
    match field.field_type {
        FieldType::String => String::new(),
        FieldType::Number => "Please reply with a number, for example 250000.".to_string(),
        FieldType::Enum => format!("Please choose one of: {}.", field.options.join(", ")),
        FieldType::Date => "Please use the format YYYY-MM-DD, for example 2027-03-01.".to_string(),
        FieldType::Phone => {
            "Please include the country code, for example +34 600 123 456.".to_string()
        }
        FieldType::Email => "Please send an address like name@example.com.".to_string(),
    }
}

/// Question asking for `field`. Enum options are appended unless the label
/// already names all of them.
pub fn ask(field: &FieldDefinition) -> String {
    let label = field.label.to_lowercase();
    match field.field_type {
        FieldType::Enum if !field.options.iter().all(|o| label.contains(&o.to_lowercase())) => {
            format!("{} ({})", field.label, field.options.join(" / "))
        }
        _ => field.label.clone(),
    }
}

pub fn acknowledge(updates: &[(String, FieldValue)]) -> Option<String> {
    if updates.is_empty() {
        return None;
    }
    let parts: Vec<String> = updates
        .iter()
        .map(|(key, value)| format!("{}: {value}", field_name(key)))
        .collect();
    Some(format!("Thanks, noted your {}.", parts.join(", ")))
}

pub fn rejected(field: &FieldDefinition, error: &ValidationError) -> String {
    let hint = type_hint(field);
    let base = format!("Sorry, that {} doesn't look right: {error}.", field_name(&field.key));
    if hint.is_empty() {
        base
    } else {
        format!("{base} {hint}")
    }
}

pub fn confirm(field_key: &str, candidate: &FieldValue) -> String {
    format!(
        "Just to confirm, your {} is {candidate}? (yes / no)",
        field_name(field_key)
    )
}

pub fn declined(field_key: &str) -> String {
    format!("Sorry about that. Let's try again with your {}.", field_name(field_key))
}

pub fn completion_summary(state: &ConversationState, schema: &FieldSchema) -> String {
    let lines: Vec<String> = schema
        .fields()
        .iter()
        .filter_map(|f| {
            state
                .value_of(&f.key)
                .map(|v| format!("- {}: {v}", field_name(&f.key)))
        })
        .collect();
    format!(
        "Thank you! I have everything I need:\n{}\nAn agent will contact you shortly.",
        lines.join("\n")
    )
}

pub fn help(schema: &FieldSchema) -> String {
    let required: Vec<String> = schema.required().map(|f| field_name(&f.key)).collect();
    format!(
        "I'm collecting a few details so an agent can help you: {}. \
         You can also ask me questions about our properties at any time.\n\
         Commands: /status shows what I have so far, /restart starts over.",
        required.join(", ")
    )
}

pub fn status(state: &ConversationState, schema: &FieldSchema) -> String {
    let collected: Vec<String> = schema
        .fields()
        .iter()
        .filter_map(|f| {
            state
                .value_of(&f.key)
                .map(|v| format!("- {}: {v}", field_name(&f.key)))
        })
        .collect();
    let missing: Vec<String> = schema
        .required()
        .filter(|f| !state.is_satisfied(&f.key))
        .map(|f| field_name(&f.key))
        .collect();

    let mut out = if collected.is_empty() {
        "I don't have any details yet.".to_string()
    } else {
        format!("Here's what I have so far:\n{}", collected.join("\n"))
    };
    if !missing.is_empty() {
        out.push_str(&format!("\nStill needed: {}.", missing.join(", ")));
    }
    out
}

pub fn terminal_reply(status: ConversationStatus) -> &'static str {
    match status {
        ConversationStatus::Abandoned => ABANDONED_REPLY,
        _ => COMPLETED_REPLY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::model::FieldSource;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn enum_question_lists_options_once() {
        let schema = FieldSchema::real_estate();
        let op = schema.get("operation").unwrap();
        assert_eq!(ask(op), op.label);

        let terse = FieldDefinition::new("op", "Buy or rent?", FieldType::Enum)
            .with_options(&["buy", "rent", "invest"]);
        assert_eq!(ask(&terse), "Buy or rent? (buy / rent / invest)");

        let name = schema.get("name").unwrap();
        assert_eq!(ask(name), name.label);
    }

    #[test]
    fn rejection_includes_hint() {
        let schema = FieldSchema::real_estate();
        let budget = schema.get("budget").unwrap();
        let msg = rejected(budget, &ValidationError::WrongType(FieldType::Number));
        assert!(msg.contains("not a valid number"));
        assert!(msg.contains("for example 250000"));
    }

    #[test]
    fn summary_and_status_follow_schema_order() {
        let schema = FieldSchema::real_estate();
        let now = Utc::now();
        let mut state = ConversationState::new("c", now);
        state.set_field("budget", FieldValue::Number(dec!(200000)), FieldSource::Inferred, Some(0.9), now);
        state.set_field("name", FieldValue::Text("Maria".into()), FieldSource::UserStated, None, now);

        let summary = completion_summary(&state, &schema);
        let name_at = summary.find("name: Maria").unwrap();
        let budget_at = summary.find("budget: 200000").unwrap();
        assert!(name_at < budget_at);

        let status = status(&state, &schema);
        assert!(status.contains("Still needed: operation, property type, location, phone."));
    }

    #[test]
    fn acknowledgement() {
        assert_eq!(acknowledge(&[]), None);
        let ack = acknowledge(&[("property_type".into(), FieldValue::Choice("house".into()))]);
        assert_eq!(ack.as_deref(), Some("Thanks, noted your property type: house."));
    }
}
