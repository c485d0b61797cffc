//! Provider flavors: per-provider adapters behind one capability trait.
//!
//! A flavor translates normalized messages into a provider request body,
//! validates required parameters locally before any I/O, issues the
//! call, and parses both single-shot and streaming responses into
//! normalized chunks. The orchestration layer works against the trait
//! and the chunk predicates only, never a concrete flavor.

pub mod anthropic;
pub mod openai;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::error::{Error, Result};
use crate::model::{ChatCompletion, CompletionResult, IndexedMessage, Message, Provider};
use crate::options::{HttpOptions, ProviderConfigs};
use crate::params::Params;
use crate::template;

pub use anthropic::AnthropicChatFlavor;
pub use openai::OpenAiChatFlavor;

/// A lazy, single-pass, forward-only sequence of normalized chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<IndexedMessage>> + Send>>;

/// A provider-specific adapter for one LLM API shape.
#[async_trait]
pub trait ChatFlavor: Send + Sync {
    /// Stable string identifier, e.g. `openai_chat`.
    fn format_type(&self) -> &'static str;

    fn provider(&self) -> Provider;

    /// Apply variable substitution to each template message's content.
    fn format_prompt(&self, template_content: &str, variables: &Params) -> Result<Vec<Message>> {
        template::format_template(template_content, variables)
    }

    /// Non-streaming call returning every choice the provider produced.
    async fn call_chat_service(
        &self,
        messages: &[Message],
        providers: &ProviderConfigs,
        parameters: &Params,
        http_options: &HttpOptions,
    ) -> Result<ChatCompletion>;

    /// Single-shot call: the first choice of `call_chat_service`, marked
    /// terminal.
    async fn call_service(
        &self,
        messages: &[Message],
        providers: &ProviderConfigs,
        parameters: &Params,
        http_options: &HttpOptions,
    ) -> Result<CompletionResult> {
        let chat = self
            .call_chat_service(messages, providers, parameters, http_options)
            .await?;
        let first = chat.first_choice().ok_or_else(|| {
            Error::Server(format!(
                "did not get any choices back from {}",
                self.provider().name()
            ))
        })?;
        Ok(CompletionResult::new(
            first.content.clone(),
            first.is_complete,
            true,
        ))
    }

    /// Streaming call. Validation and body construction are identical to
    /// the non-streaming path, with the provider's streaming flag set.
    async fn call_service_stream(
        &self,
        messages: &[Message],
        providers: &ProviderConfigs,
        parameters: &Params,
        http_options: &HttpOptions,
    ) -> Result<ChunkStream>;

    /// Canonical serialization used only for record payloads, never for
    /// wire transmission.
    fn serialize_for_record(&self, messages: &[Message]) -> Result<String> {
        Ok(serde_json::to_string(messages)?)
    }

    fn content_of<'a>(&self, chunk: &'a IndexedMessage) -> &'a str {
        &chunk.content
    }

    fn is_last_chunk(&self, chunk: &IndexedMessage) -> bool {
        chunk.is_last
    }

    fn is_complete(&self, chunk: &IndexedMessage) -> bool {
        chunk.is_complete
    }
}

impl std::fmt::Debug for dyn ChatFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatFlavor")
            .field("format_type", &self.format_type())
            .finish_non_exhaustive()
    }
}

/// Look up a flavor by its format identifier.
///
/// The set of flavors is fixed at build time; an unrecognized name is a
/// configuration error naming the identifier.
pub fn flavor_for_name(name: &str) -> Result<Arc<dyn ChatFlavor>> {
    match name {
        openai::FORMAT_TYPE => Ok(Arc::new(OpenAiChatFlavor)),
        anthropic::FORMAT_TYPE => Ok(Arc::new(AnthropicChatFlavor)),
        other => Err(Error::Config(format!(
            "unable to create flavor for name '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_flavors() {
        assert_eq!(
            flavor_for_name("openai_chat").unwrap().format_type(),
            "openai_chat"
        );
        assert_eq!(
            flavor_for_name("anthropic_chat").unwrap().format_type(),
            "anthropic_chat"
        );
    }

    #[test]
    fn test_lookup_is_idempotent() {
        let first = flavor_for_name("openai_chat").unwrap();
        let second = flavor_for_name("openai_chat").unwrap();
        assert_eq!(first.format_type(), second.format_type());
        assert_eq!(first.provider(), second.provider());
    }

    #[test]
    fn test_lookup_unknown_name_fails_closed() {
        let err = flavor_for_name("cohere_chat").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("cohere_chat"));
    }

    #[test]
    fn test_serialize_for_record_round_trips() {
        let flavor = flavor_for_name("openai_chat").unwrap();
        let messages = vec![
            Message::new("system", "be brief"),
            Message::new("user", "hello"),
        ];
        let serialized = flavor.serialize_for_record(&messages).unwrap();
        let parsed: Vec<Message> = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed, messages);
    }
}
