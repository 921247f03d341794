//! Cheap, rule-based classification of inbound text.
//!
//! Runs before any capability call. It only decides routing; the field
//! tracker and responder still do the real work.

use std::sync::LazyLock;

use regex::Regex;

static QUESTION_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(what|which|where|when|who|why|how|do|does|did|is|are|can|could|would|should|qu[eé]|cu[aá]l|cu[aá]les|d[oó]nde|cu[aá]ndo|c[oó]mo|cu[aá]nto|cu[aá]nta|cu[aá]ntos|hay|tienen|tienes|puedo|puede)\b",
    )
    .unwrap()
});

static GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(hi|hello|hey|hiya|good (morning|afternoon|evening)|hola|buenas|buenos d[ií]as|buenas (tardes|noches))[\s!.,]*$",
    )
    .unwrap()
});

static AFFIRMATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(yes|yeah|yep|yup|sure|correct|right|exactly|ok|okay|s[ií]|claro|correcto|exacto|vale)[\s!.,]*$")
        .unwrap()
});

static NEGATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(no|nope|nah|wrong|incorrect|not really|no es (as[ií]|correcto))[\s!.,]*$")
        .unwrap()
});

/// Slash commands understood by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Restart,
}

impl Command {
    fn parse(text: &str) -> Option<Self> {
        let word = text.trim().strip_prefix('/')?.split_whitespace().next()?;
        match word.to_lowercase().as_str() {
            "help" | "ayuda" => Some(Self::Help),
            "status" | "estado" => Some(Self::Status),
            "restart" | "reset" | "reiniciar" => Some(Self::Restart),
            _ => None,
        }
    }
}

/// How an inbound message should be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Command(Command),
    Greeting,
    Affirmative,
    Negative,
    Question,
    /// Anything else: a candidate answer for the pending field.
    Statement,
}

impl MessageKind {
    /// Whether the text may be parsed literally as the pending field's value.
    pub fn is_answer_candidate(&self) -> bool {
        matches!(self, Self::Statement | Self::Affirmative | Self::Negative)
    }
}

pub fn classify(text: &str) -> MessageKind {
    let trimmed = text.trim();
    if let Some(cmd) = Command::parse(trimmed) {
        return MessageKind::Command(cmd);
    }
    if GREETING.is_match(trimmed) {
        return MessageKind::Greeting;
    }
    if AFFIRMATIVE.is_match(trimmed) {
        return MessageKind::Affirmative;
    }
    if NEGATIVE.is_match(trimmed) {
        return MessageKind::Negative;
    }
    if is_question(trimmed) {
        return MessageKind::Question;
    }
    MessageKind::Statement
}

/// Question-like: a question mark anywhere, an inverted question mark, or a
/// leading interrogative word.
pub fn is_question(text: &str) -> bool {
    text.contains('?') || text.contains('¿') || QUESTION_START.is_match(text.trim())
}
