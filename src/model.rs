//! Common data models for prompts, completions, and streamed chunks.

use serde::{Deserialize, Serialize};

use crate::params::Params;

/// LLM providers with a shipped flavor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
}

impl Provider {
    /// Stable identifier used in record payloads.
    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
        }
    }
}

/// A single message in a conversation.
///
/// Roles are provider-defined strings (`system`, `user`, `assistant`, ...).
/// Messages are immutable once formatted from a template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// One normalized unit of a (possibly streamed) completion.
///
/// `index` orders choices within one response; providers that return a
/// single choice always use index 0. `is_complete` signals the model
/// reached a natural stop rather than being truncated. `is_last` marks
/// the terminal unit of the stream and triggers record finalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedMessage {
    pub role: String,
    pub content: String,
    pub index: u32,
    pub is_complete: bool,
    pub is_last: bool,
    /// Assigned after a successful recording call, at most once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_id: Option<String>,
}

impl IndexedMessage {
    pub fn new(
        role: impl Into<String>,
        content: impl Into<String>,
        index: u32,
        is_complete: bool,
        is_last: bool,
    ) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            index,
            is_complete,
            is_last,
            completion_id: None,
        }
    }

    /// Down-cast to a plain message, stripping the bookkeeping fields.
    ///
    /// Providers must never see index or completion metadata, so chat
    /// history built from streamed chunks goes through here before
    /// resubmission.
    pub fn to_message(&self) -> Message {
        Message::new(self.role.clone(), self.content.clone())
    }
}

/// The single-shot or aggregated-stream result of one call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionResult {
    pub content: String,
    pub is_complete: bool,
    pub is_last: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_id: Option<String>,
}

impl CompletionResult {
    pub fn new(content: impl Into<String>, is_complete: bool, is_last: bool) -> Self {
        Self {
            content: content.into(),
            is_complete,
            is_last,
            completion_id: None,
        }
    }
}

/// A multi-choice chat response from a single non-streaming call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatCompletion {
    pub choices: Vec<IndexedMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_id: Option<String>,
}

impl ChatCompletion {
    pub fn new(choices: Vec<IndexedMessage>) -> Self {
        Self {
            choices,
            completion_id: None,
        }
    }

    pub fn first_choice(&self) -> Option<&IndexedMessage> {
        self.choices.first()
    }

    /// Content of the first choice, empty if the response had none.
    pub fn content(&self) -> &str {
        self.first_choice().map(|c| c.content.as_str()).unwrap_or("")
    }

    pub fn is_complete(&self) -> bool {
        self.first_choice().map(|c| c.is_complete).unwrap_or(false)
    }
}

/// Immutable descriptor of one resolved prompt template version.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    pub name: String,
    /// JSON-encoded array of `{role, content}` template messages.
    pub content: String,
    pub flavor_name: String,
    pub project_version_id: String,
    pub prompt_template_id: String,
    pub prompt_template_version_id: String,
    pub llm_parameters: Params,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_names() {
        assert_eq!(Provider::OpenAi.name(), "openai");
        assert_eq!(Provider::Anthropic.name(), "anthropic");
    }

    #[test]
    fn test_to_message_strips_bookkeeping() {
        let mut chunk = IndexedMessage::new("assistant", "hi", 2, true, true);
        chunk.completion_id = Some("abc".to_string());

        let message = chunk.to_message();
        assert_eq!(message.role, "assistant");
        assert_eq!(message.content, "hi");

        let serialized = serde_json::to_value(&message).unwrap();
        assert!(serialized.get("index").is_none());
        assert!(serialized.get("completion_id").is_none());
        assert!(serialized.get("is_last").is_none());
    }

    #[test]
    fn test_chat_completion_first_choice() {
        let completion = ChatCompletion::new(vec![
            IndexedMessage::new("assistant", "first", 0, true, true),
            IndexedMessage::new("assistant", "second", 1, false, true),
        ]);
        assert_eq!(completion.content(), "first");
        assert!(completion.is_complete());

        let empty = ChatCompletion::new(vec![]);
        assert_eq!(empty.content(), "");
        assert!(!empty.is_complete());
    }
}
