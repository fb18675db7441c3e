//! Role catalogue
//!
//! A role is the coarse category a request maps to. It selects the system
//! prompt and the tool whitelists for the agent loop. The set is fixed at
//! startup and read-only afterwards.

use integrations::{ChatMessage, ChatOptions, LlmClient};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Role {
    pub name: &'static str,
    pub system_prompt: &'static str,
    /// Remote tool servers this role may use.
    pub mcp_servers: Vec<String>,
    /// Internal tools (unprefixed names) this role may use.
    pub internal_tools: Vec<String>,
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// The closed role set.
pub struct RoleSet {
    roles: Vec<Role>,
}

impl RoleSet {
    pub fn builtin() -> Self {
        let roles = vec![
            Role {
                name: "conversation",
                system_prompt: "You are a friendly, concise voice assistant. Answer directly; \
                                replies are read aloud, so keep them short.",
                mcp_servers: vec![],
                internal_tools: vec![],
            },
            Role {
                name: "knowledge",
                system_prompt: "You answer questions from the user's document collection. Ground \
                                every statement in the provided context and say so when the \
                                context does not cover the question.",
                mcp_servers: vec![],
                internal_tools: strings(&["knowledge_search"]),
            },
            Role {
                name: "smart_home",
                system_prompt: "You control the user's home. Use the available tools to act and \
                                confirm what you did in one short sentence.",
                mcp_servers: strings(&["homeassistant"]),
                internal_tools: strings(&[
                    "resolve_room_player",
                    "media_control",
                    "get_user_location",
                    "get_all_presence",
                ]),
            },
            Role {
                name: "documents",
                system_prompt: "You help the user find and work with their documents.",
                mcp_servers: strings(&["documents"]),
                internal_tools: strings(&["knowledge_search"]),
            },
            Role {
                name: "media",
                system_prompt: "You play and control music and media. Resolve what the user \
                                wants to hear, then start playback in the right room. When a \
                                speaker is busy, ask before interrupting.",
                mcp_servers: strings(&["media"]),
                internal_tools: strings(&[
                    "resolve_room_player",
                    "play_in_room",
                    "media_control",
                ]),
            },
            Role {
                name: "research",
                system_prompt: "You research questions using the available search tools and \
                                summarize findings with sources.",
                mcp_servers: strings(&["research"]),
                internal_tools: strings(&["knowledge_search"]),
            },
            Role {
                name: "workflow",
                system_prompt: "You run the user's automations and multi-step workflows.",
                mcp_servers: strings(&["workflow"]),
                internal_tools: vec![],
            },
            Role {
                name: "general",
                system_prompt: "You are a capable assistant with access to every tool. Prefer \
                                acting over explaining.",
                mcp_servers: strings(&["*"]),
                internal_tools: strings(&["*"]),
            },
        ];
        Self { roles }
    }

    pub fn get(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.roles.iter().map(|r| r.name).collect()
    }
}

#[derive(Deserialize)]
struct Classification {
    role: String,
}

/// Map an utterance to a role with a short JSON-mode call against the
/// classifier model. Unknown or unparseable output falls back to
/// `conversation`.
pub async fn classify<'a>(
    llm: &dyn LlmClient,
    classifier_model: &str,
    roles: &'a RoleSet,
    utterance: &str,
    history: &[ChatMessage],
) -> &'a Role {
    let recent: Vec<String> = history
        .iter()
        .rev()
        .take(4)
        .rev()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect();

    let system = format!(
        "Classify the user request into exactly one category out of: {}. \
         conversation = small talk or a question needing no action and no documents. \
         knowledge = a question about the user's own documents. \
         smart_home = lights, switches, climate, presence. \
         media = music, radio, playback control. \
         documents = finding or managing files. \
         research = questions needing web or external search. \
         workflow = running automations. \
         general = anything else that needs tools. \
         Respond as JSON: {{\"role\": \"<category>\"}}",
        roles.names().join(", ")
    );
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

    let fallback = roles.get("conversation").expect("builtin role");
    match llm.chat(&messages, &options).await {
        Ok(raw) => match serde_json::from_str::<Classification>(&raw) {
            Ok(c) => match roles.get(c.role.trim()) {
                Some(role) => {
                    debug!(role = role.name, "Request classified");
                    role
                }
                None => {
                    warn!(role = %c.role, "Classifier produced unknown role");
                    fallback
                }
            },
            Err(e) => {
                warn!(error = %e, "Unparseable classification, defaulting to conversation");
                fallback
            }
        },
        Err(e) => {
            warn!(error = %e, "Classification call failed, defaulting to conversation");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use integrations::MockLlm;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_classify_known_role() {
        let llm = Arc::new(MockLlm::with_replies(vec![r#"{"role": "media"}"#]));
        let roles = RoleSet::builtin();
        let role = classify(llm.as_ref(), "clf", &roles, "play some jazz", &[]).await;
        assert_eq!(role.name, "media");
        assert!(role.internal_tools.contains(&"play_in_room".to_string()));
    }

    #[tokio::test]
    async fn test_classify_unknown_falls_back_to_conversation() {
        let llm = Arc::new(MockLlm::with_replies(vec![r#"{"role": "time_travel"}"#]));
        let roles = RoleSet::builtin();
        let role = classify(llm.as_ref(), "clf", &roles, "take me to 1985", &[]).await;
        assert_eq!(role.name, "conversation");
    }

    #[tokio::test]
    async fn test_classify_garbage_falls_back() {
        let llm = Arc::new(MockLlm::with_replies(vec!["certainly! the role is media"]));
        let roles = RoleSet::builtin();
        let role = classify(llm.as_ref(), "clf", &roles, "play jazz", &[]).await;
        assert_eq!(role.name, "conversation");
    }

    #[test]
    fn test_role_set_is_closed() {
        let roles = RoleSet::builtin();
        assert_eq!(roles.names().len(), 8);
        assert!(roles.get("conversation").is_some());
        assert!(roles.get("general").is_some());
        assert!(roles.get("made_up").is_none());
    }
}
