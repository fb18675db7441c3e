//! Legacy ranked-intent path
//!
//! Kept for deployments running with the agent disabled. One JSON-mode call
//! maps the utterance to a ranked list of `{intent, parameters, confidence}`
//! candidates over the closed set of tool names; the router then tries them
//! in descending confidence until one succeeds.

use crate::tools::ToolSpec;
use integrations::{ChatMessage, ChatOptions, LlmClient};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

pub const CONVERSATION_INTENT: &str = "general.conversation";
pub const UNRESOLVED_INTENT: &str = "general.unresolved";

#[derive(Debug, Clone, Deserialize)]
pub struct RankedIntent {
    pub intent: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub confidence: f32,
}

#[derive(Deserialize)]
struct RankedResponse {
    #[serde(default)]
    intents: Vec<RankedIntent>,
}

/// Action words that signal a home-automation command even when the model's
/// JSON comes back broken.
const ACTION_KEYWORDS: [&str; 10] = [
    "turn on",
    "turn off",
    "switch",
    "dim",
    "start",
    "stop",
    "einschalten",
    "ausschalten",
    "anmachen",
    "ausmachen",
];
const DEVICE_KEYWORDS: [&str; 10] = [
    "light",
    "lamp",
    "speaker",
    "heating",
    "fan",
    "plug",
    "licht",
    "lampe",
    "heizung",
    "steckdose",
];

/// Ask the LLM for ranked intent candidates. On unparseable output the
/// home-automation recovery heuristic may still synthesize a best guess.
pub async fn extract_ranked_intents(
    llm: &dyn LlmClient,
    classifier_model: &str,
    utterance: &str,
    tools: &[ToolSpec],
    history: &[ChatMessage],
) -> Vec<RankedIntent> {
    let intent_names: Vec<&str> = tools.iter().map(|s| s.name.as_str()).collect();
    let system = format!(
        "Map the user request to a ranked list of intents. Valid intents: {}, {}, {}. \
         Respond as JSON: {{\"intents\": [{{\"intent\": \"<name>\", \"parameters\": {{...}}, \
         \"confidence\": 0.0-1.0}}]}} ordered best first. Use {} for small talk and {} when \
         nothing fits.",
        intent_names.join(", "),
        CONVERSATION_INTENT,
        UNRESOLVED_INTENT,
        CONVERSATION_INTENT,
        UNRESOLVED_INTENT,
    );

    let recent: Vec<String> = history
        .iter()
        .rev()
        .take(4)
        .rev()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect();
    let mut prompt = String::new();
    if !recent.is_empty() {
        prompt.push_str(&format!("Recent conversation:\n{}\n\n", recent.join("\n")));
    }
    prompt.push_str(&format!("Request: {utterance}"));

    let messages = vec![ChatMessage::system(system), ChatMessage::user(prompt)];
    let options = ChatOptions {
        model: Some(classifier_model.to_string()),
        temperature: Some(0.0),
        json_mode: true,
    };

    let raw = match llm.chat(&messages, &options).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "Ranked intent extraction failed");
            return fallback_intents(utterance);
        }
    };

    match serde_json::from_str::<RankedResponse>(&raw) {
        Ok(parsed) if !parsed.intents.is_empty() => {
            let mut intents = parsed.intents;
            intents.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            debug!(count = intents.len(), "Ranked intents extracted");
            intents
        }
        Ok(_) => fallback_intents(utterance),
        Err(e) => {
            warn!(error = %e, "Unparseable ranked-intent JSON");
            fallback_intents(utterance)
        }
    }
}

fn fallback_intents(utterance: &str) -> Vec<RankedIntent> {
    match recover_home_intent(utterance) {
        Some(recovered) => vec![
            recovered,
            RankedIntent {
                intent: CONVERSATION_INTENT.to_string(),
                parameters: Value::Null,
                confidence: 0.2,
            },
        ],
        None => vec![RankedIntent {
            intent: CONVERSATION_INTENT.to_string(),
            parameters: Value::Null,
            confidence: 1.0,
        }],
    }
}

/// Bespoke recovery for home-automation commands: when the model's JSON is
/// unusable but the utterance clearly contains an action plus a device
/// keyword, synthesize a best-guess intent at reduced confidence.
pub fn recover_home_intent(utterance: &str) -> Option<RankedIntent> {
    let lowered = utterance.to_lowercase();
    let action = ACTION_KEYWORDS.iter().find(|k| lowered.contains(*k))?;
    let device = DEVICE_KEYWORDS.iter().find(|k| lowered.contains(*k))?;

    debug!(action = *action, device = *device, "Recovered home-automation intent");
    Some(RankedIntent {
        intent: "homeassistant.control".to_string(),
        parameters: serde_json::json!({
            "action": action,
            "device_hint": device,
            "query": utterance,
        }),
        confidence: 0.4,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use integrations::MockLlm;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ranked_intents_sorted_by_confidence() {
        let llm = Arc::new(MockLlm::with_replies(vec![
            r#"{"intents": [
                {"intent": "general.conversation", "parameters": {}, "confidence": 0.3},
                {"intent": "internal.play_in_room", "parameters": {"room_name": "Kitchen"}, "confidence": 0.9}
            ]}"#,
        ]));
        let intents =
            extract_ranked_intents(llm.as_ref(), "clf", "play music in the kitchen", &[], &[])
                .await;
        assert_eq!(intents[0].intent, "internal.play_in_room");
        assert_eq!(intents[1].intent, CONVERSATION_INTENT);
    }

    #[tokio::test]
    async fn test_broken_json_recovers_home_intent() {
        let llm = Arc::new(MockLlm::with_replies(vec!["{{{ nonsense"]));
        let intents =
            extract_ranked_intents(llm.as_ref(), "clf", "please turn on the light", &[], &[])
                .await;
        assert_eq!(intents[0].intent, "homeassistant.control");
        assert!(intents[0].confidence < 0.5);
        assert_eq!(intents.last().unwrap().intent, CONVERSATION_INTENT);
    }

    #[tokio::test]
    async fn test_broken_json_without_keywords_falls_back_to_conversation() {
        let llm = Arc::new(MockLlm::with_replies(vec!["not json"]));
        let intents =
            extract_ranked_intents(llm.as_ref(), "clf", "tell me a story", &[], &[]).await;
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].intent, CONVERSATION_INTENT);
    }

    #[test]
    fn test_recover_requires_both_keyword_classes() {
        assert!(recover_home_intent("turn on the lamp").is_some());
        assert!(recover_home_intent("turn on the universe").is_none());
        assert!(recover_home_intent("I like my lamp").is_none());
    }
}
