//! Whether a query can be answered by an on-device model

use serde::{Deserialize, Serialize};

use crate::inference::InferenceRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Greeting,
    Question,
    Command,
    Goodbye,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub kind: IntentKind,
    pub confidence: f32,
    pub resolvable_locally: bool,
}

#[cfg_attr(test, mockall::automock)]
pub trait IntentResolver: Send + Sync {
    fn resolve(&self, request: &InferenceRequest) -> Intent;
}

/// Substring patterns per intent kind, first match wins
const PATTERNS: &[(&str, IntentKind)] = &[
    ("hello", IntentKind::Greeting),
    ("good morning", IntentKind::Greeting),
    ("hi ", IntentKind::Greeting),
    ("goodbye", IntentKind::Goodbye),
    ("bye", IntentKind::Goodbye),
    ("turn on", IntentKind::Command),
    ("turn off", IntentKind::Command),
    ("set ", IntentKind::Command),
    ("stop", IntentKind::Command),
    ("what", IntentKind::Question),
    ("how", IntentKind::Question),
    ("why", IntentKind::Question),
    ("when", IntentKind::Question),
    ("who", IntentKind::Question),
    ("where", IntentKind::Question),
    ("?", IntentKind::Question),
];

/// Pattern matcher that treats every recognised intent as locally resolvable
#[derive(Debug, Clone, Default)]
pub struct PatternIntentResolver;

impl IntentResolver for PatternIntentResolver {
    fn resolve(&self, request: &InferenceRequest) -> Intent {
        let text = format!("{} ", request.prompt.to_lowercase());
        let kind = PATTERNS
            .iter()
            .find(|(pattern, _)| text.contains(pattern))
            .map(|(_, kind)| *kind)
            .unwrap_or(IntentKind::Unknown);

        match kind {
            IntentKind::Unknown => Intent {
                kind,
                confidence: 0.1,
                resolvable_locally: false,
            },
            _ => Intent {
                kind,
                confidence: 0.8,
                resolvable_locally: true,
            },
        }
    }
}

/// Resolver for deployments that never consider external models
#[derive(Debug, Clone, Default)]
pub struct LocalIntentResolver;

impl IntentResolver for LocalIntentResolver {
    fn resolve(&self, _request: &InferenceRequest) -> Intent {
        Intent {
            kind: IntentKind::Unknown,
            confidence: 1.0,
            resolvable_locally: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[parameterized(
        greeting = { "Hello there", IntentKind::Greeting, true },
        question = { "What time is it?", IntentKind::Question, true },
        command = { "Turn on the lights", IntentKind::Command, true },
        goodbye = { "ok bye", IntentKind::Goodbye, true },
        unknown = { "Summarise the quarterly report", IntentKind::Unknown, false },
    )]
    fn test_pattern_resolution(prompt: &str, kind: IntentKind, local: bool) {
        let intent = PatternIntentResolver.resolve(&InferenceRequest::new("m", prompt));
        assert_eq!(intent.kind, kind);
        assert_eq!(intent.resolvable_locally, local);
    }
}
