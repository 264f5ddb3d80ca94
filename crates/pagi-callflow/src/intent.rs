//! Coarse intent labels supplied by the external classifier, and the per-turn input.

use crate::lexicon::{normalize, tokenize};
use serde::{Deserialize, Serialize};

/// Category label attached to a recognized utterance. The classifier is imperfect;
/// nothing downstream may assume the label is right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", from = "String")]
pub enum CoarseIntent {
    Greeting,
    Inquiry,
    HandoffRequest,
    HandoffYes,
    HandoffNo,
    EndCall,
    NotHeard,
    #[default]
    Unknown,
    SalesTopic,
}

impl CoarseIntent {
    /// Lenient label parsing: case-insensitive, `-`/space tolerant. Anything else is `Unknown`.
    pub fn from_label(label: &str) -> Self {
        let key: String = label
            .trim()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        match key.as_str() {
            "GREETING" => Self::Greeting,
            "INQUIRY" => Self::Inquiry,
            "HANDOFF_REQUEST" => Self::HandoffRequest,
            "HANDOFF_YES" => Self::HandoffYes,
            "HANDOFF_NO" => Self::HandoffNo,
            "END_CALL" => Self::EndCall,
            "NOT_HEARD" => Self::NotHeard,
            "SALES_TOPIC" => Self::SalesTopic,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "GREETING",
            Self::Inquiry => "INQUIRY",
            Self::HandoffRequest => "HANDOFF_REQUEST",
            Self::HandoffYes => "HANDOFF_YES",
            Self::HandoffNo => "HANDOFF_NO",
            Self::EndCall => "END_CALL",
            Self::NotHeard => "NOT_HEARD",
            Self::Unknown => "UNKNOWN",
            Self::SalesTopic => "SALES_TOPIC",
        }
    }

    /// Intents that belong to the handoff dialogue itself.
    pub fn is_handoff_related(&self) -> bool {
        matches!(self, Self::HandoffRequest | Self::HandoffYes | Self::HandoffNo)
    }
}

impl From<String> for CoarseIntent {
    fn from(label: String) -> Self {
        Self::from_label(&label)
    }
}

impl std::fmt::Display for CoarseIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One final recognition result, normalized once for every downstream matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnInput {
    pub raw_text: String,
    pub normalized: String,
    pub intent: CoarseIntent,
}

impl TurnInput {
    pub fn new(raw_text: impl Into<String>, intent: CoarseIntent) -> Self {
        let raw_text = raw_text.into();
        let normalized = normalize(&raw_text);
        Self {
            raw_text,
            normalized,
            intent,
        }
    }

    pub fn tokens(&self) -> Vec<&str> {
        tokenize(&self.normalized)
    }

    /// Nothing usable reached us: either the recognizer said so or the text is empty.
    pub fn is_not_heard(&self) -> bool {
        self.intent == CoarseIntent::NotHeard || self.normalized.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_label_is_lenient() {
        assert_eq!(CoarseIntent::from_label("handoff_yes"), CoarseIntent::HandoffYes);
        assert_eq!(CoarseIntent::from_label(" Handoff-Request "), CoarseIntent::HandoffRequest);
        assert_eq!(CoarseIntent::from_label("END CALL"), CoarseIntent::EndCall);
        assert_eq!(CoarseIntent::from_label("weather"), CoarseIntent::Unknown);
        assert_eq!(CoarseIntent::from_label(""), CoarseIntent::Unknown);
    }

    #[test]
    fn test_serde_accepts_unknown_labels() {
        let intent: CoarseIntent = serde_json::from_str("\"SALES_TOPIC\"").unwrap();
        assert_eq!(intent, CoarseIntent::SalesTopic);
        let intent: CoarseIntent = serde_json::from_str("\"something-new\"").unwrap();
        assert_eq!(intent, CoarseIntent::Unknown);
        assert_eq!(serde_json::to_string(&CoarseIntent::HandoffNo).unwrap(), "\"HANDOFF_NO\"");
    }

    #[test]
    fn test_empty_text_is_not_heard() {
        assert!(TurnInput::new("  ...  ", CoarseIntent::Inquiry).is_not_heard());
        assert!(TurnInput::new("hello", CoarseIntent::NotHeard).is_not_heard());
        assert!(!TurnInput::new("hello", CoarseIntent::Greeting).is_not_heard());
    }
}
