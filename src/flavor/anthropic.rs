//! Anthropic messages flavor and its event/data stream parser.
//!
//! The streaming wire format follows the generic server-sent-events
//! interpretation: `event:` names an event, `data:` lines carry JSON
//! payloads dispatched on an embedded `type` discriminator, and a blank
//! line closes the open event. Unknown event kinds are the sanctioned
//! forward-compatibility mechanism and are discarded without error; the
//! outer framing is strict.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::flavor::{ChatFlavor, ChunkStream};
use crate::http;
use crate::model::{ChatCompletion, CompletionResult, IndexedMessage, Message, Provider};
use crate::options::{AnthropicConfig, HttpOptions, ProviderConfigs};
use crate::params::Params;
use crate::sse::LineStreamExt;

pub(crate) const FORMAT_TYPE: &str = "anthropic_chat";
const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const CONTENT_BLOCK_DELTA: &str = "content_block_delta";
const MESSAGE_DELTA: &str = "message_delta";

/// The `anthropic_chat` flavor.
pub struct AnthropicChatFlavor;

impl AnthropicChatFlavor {
    fn config<'a>(providers: &'a ProviderConfigs) -> Result<&'a AnthropicConfig> {
        providers.anthropic.as_ref().ok_or_else(|| {
            Error::Config(
                "the Anthropic provider is not configured; set it up to call Anthropic endpoints"
                    .to_string(),
            )
        })
    }

    fn validate_parameters(parameters: &Params) -> Result<()> {
        for required in ["model", "max_tokens"] {
            if !parameters.contains_key(required) {
                return Err(Error::Client(format!(
                    "the '{required}' parameter is required when calling Anthropic"
                )));
            }
        }
        if parameters.contains_key("prompt") {
            return Err(Error::Client(
                "the 'prompt' parameter cannot be specified; it is populated automatically"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Build the request body. A formatted system message is removed
    /// from the message array and submitted as the top-level `system`
    /// field, which is where Anthropic expects it.
    fn request_body(messages: &[Message], parameters: &Params, stream: bool) -> Result<Value> {
        let mut body = parameters.clone();

        let without_system: Vec<&Message> =
            messages.iter().filter(|m| m.role != "system").collect();
        body.insert(
            "messages".to_string(),
            serde_json::to_value(&without_system)?,
        );
        if let Some(system) = messages.iter().find(|m| m.role == "system") {
            body.insert("system".to_string(), Value::String(system.content.clone()));
        }
        if stream {
            body.insert("stream".to_string(), Value::Bool(true));
        }
        Ok(Value::Object(body))
    }

    fn url(config: &AnthropicConfig) -> String {
        let base = config.base_url.as_deref().unwrap_or(DEFAULT_API_BASE);
        format!("{base}/v1/messages")
    }
}

#[async_trait]
impl ChatFlavor for AnthropicChatFlavor {
    fn format_type(&self) -> &'static str {
        FORMAT_TYPE
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn call_chat_service(
        &self,
        messages: &[Message],
        providers: &ProviderConfigs,
        parameters: &Params,
        http_options: &HttpOptions,
    ) -> Result<ChatCompletion> {
        Self::validate_parameters(parameters)?;
        let config = Self::config(providers)?;
        let body = Self::request_body(messages, parameters, false)?;

        let client = http::build_http_client(http_options)?;
        let response = client
            .post(Self::url(config))
            .header("accept", "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("x-api-key", config.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(http::status_error(status, &text));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| Error::Server(format!("error parsing Anthropic response: {e}")))?;
        let is_complete = parsed.stop_reason.as_deref() == Some("stop_sequence");

        let choices = parsed
            .content
            .into_iter()
            .enumerate()
            .map(|(index, block)| {
                IndexedMessage::new(
                    parsed.role.clone(),
                    block.text.unwrap_or_default(),
                    index as u32,
                    is_complete,
                    true,
                )
            })
            .collect();
        Ok(ChatCompletion::new(choices))
    }

    async fn call_service_stream(
        &self,
        messages: &[Message],
        providers: &ProviderConfigs,
        parameters: &Params,
        http_options: &HttpOptions,
    ) -> Result<ChunkStream> {
        Self::validate_parameters(parameters)?;
        let config = Self::config(providers)?;
        let body = Self::request_body(messages, parameters, true)?;

        let client = http::build_http_client(http_options)?;
        let response = client
            .post(Self::url(config))
            .header("accept", "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("x-api-key", config.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(http::status_error(status, &text));
        }

        let stream = try_stream! {
            let lines = response.lines();
            futures::pin_mut!(lines);
            // Owned by this generator alone; single-threaded by
            // construction, so no lock is needed around the transitions.
            let mut state = StreamState::default();
            while let Some(line) = lines.next().await {
                if let Some(event) = handle_line(&line?, &mut state)? {
                    yield IndexedMessage::new(
                        "assistant",
                        event.content,
                        0,
                        event.is_complete,
                        event.is_last,
                    );
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Mutable state of one in-flight event/data stream.
///
/// Owned by exactly one stream and reset after every finalized or
/// discarded event. Two events must never be open at once.
#[derive(Default)]
struct StreamState {
    event_name: Option<String>,
    data: String,
    stop_reason: Option<String>,
    is_complete: bool,
}

impl StreamState {
    fn start_event(&mut self, name: &str) -> Result<()> {
        if let Some(open) = &self.event_name {
            return Err(Error::Protocol(format!(
                "attempting to start a new event ({name}) when the previous ({open}) has not been closed"
            )));
        }
        self.event_name = Some(name.to_string());
        Ok(())
    }

    fn append_data(&mut self, text: &str) {
        self.data.push_str(text);
    }

    fn set_stop_reason(&mut self, stop_reason: Option<String>) {
        if stop_reason.as_deref() == Some("stop_sequence") {
            self.is_complete = true;
        }
        self.stop_reason = stop_reason;
    }

    /// Read the accumulated event and reset, in one step.
    fn close_current_event(&mut self) -> CompletionResult {
        let is_last = self.stop_reason.is_some();
        let result = CompletionResult::new(std::mem::take(&mut self.data), self.is_complete, is_last);
        self.reset();
        result
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Advance the event/data parser by one wire line.
///
/// Returns the finished event when the line closed a content-bearing
/// event, `None` otherwise.
fn handle_line(line: &str, state: &mut StreamState) -> Result<Option<CompletionResult>> {
    if line.trim().is_empty() {
        return Ok(finish_event(state));
    }

    let (field, value) = line
        .split_once(':')
        .ok_or_else(|| Error::Protocol(format!("got unknown line in the stream: '{line}'")))?;
    let field = field.trim();
    let value = value.trim_start();

    match field {
        "event" => {
            state.start_event(value)?;
            Ok(None)
        }
        "data" => {
            if value.trim().is_empty() {
                return Ok(None);
            }
            let event: DataEvent = serde_json::from_str(value)
                .map_err(|e| Error::Protocol(format!("error processing Anthropic stream: {e}")))?;
            match event.kind.as_str() {
                // Text is streamed through content block delta events.
                CONTENT_BLOCK_DELTA => {
                    if let Some(text) = event.delta.text {
                        state.append_data(&text);
                    }
                }
                // The stop reason arrives through a message delta event,
                // after the message itself is complete.
                MESSAGE_DELTA => state.set_stop_reason(event.delta.stop_reason),
                _ => {}
            }
            Ok(None)
        }
        other => Err(Error::Protocol(format!(
            "got unknown field in the stream: '{other}'"
        ))),
    }
}

fn finish_event(state: &mut StreamState) -> Option<CompletionResult> {
    match state.event_name.as_deref() {
        Some(CONTENT_BLOCK_DELTA) | Some(MESSAGE_DELTA) => Some(state.close_current_event()),
        _ => {
            // Anthropic asks clients to tolerate new event types, so
            // pings and anything unrecognized are dropped silently.
            state.reset();
            None
        }
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    role: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct DataEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: DataDelta,
}

#[derive(Deserialize, Default)]
struct DataDelta {
    text: Option<String>,
    stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drive(lines: &[&str]) -> Vec<CompletionResult> {
        let mut state = StreamState::default();
        let mut events = Vec::new();
        for line in lines {
            if let Some(event) = handle_line(line, &mut state).unwrap() {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn test_event_stream_aggregates_content() {
        let events = drive(&[
            "event: content_block_delta",
            r#"data: {"type":"content_block_delta","delta":{"text":"Oh"}}"#,
            "",
            "event: content_block_delta",
            r#"data: {"type":"content_block_delta","delta":{"text":" dear"}}"#,
            "",
            "event: content_block_delta",
            r#"data: {"type":"content_block_delta","delta":{"text":","}}"#,
            "",
            "event: content_block_delta",
            r#"data: {"type":"content_block_delta","delta":{"text":" really"}}"#,
            "",
            "event: message_delta",
            r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"}}"#,
            "",
        ]);

        let aggregated: String = events.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(aggregated, "Oh dear, really");

        let last = events.last().unwrap();
        assert!(last.is_last);
        // "end_turn" is not the stop_sequence completion condition.
        assert!(!last.is_complete);
    }

    #[test]
    fn test_stop_sequence_marks_complete() {
        let events = drive(&[
            "event: message_delta",
            r#"data: {"type":"message_delta","delta":{"stop_reason":"stop_sequence"}}"#,
            "",
        ]);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_last);
        assert!(events[0].is_complete);
    }

    #[test]
    fn test_unknown_events_are_discarded_silently() {
        let events = drive(&[
            "event: ping",
            r#"data: {"type":"ping"}"#,
            "",
            "event: shiny_new_event",
            r#"data: {"type":"shiny_new_event","delta":{"text":"ignored"}}"#,
            "",
        ]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_nested_event_is_a_protocol_error() {
        let mut state = StreamState::default();
        handle_line("event: content_block_delta", &mut state).unwrap();
        let err = handle_line("event: message_delta", &mut state).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_strict_outer_framing() {
        let mut state = StreamState::default();
        let err = handle_line("retry: 500", &mut state).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("retry"));

        let err = handle_line("no colon here", &mut state).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_blank_data_value_is_ignored() {
        let mut state = StreamState::default();
        handle_line("event: content_block_delta", &mut state).unwrap();
        assert!(handle_line("data: ", &mut state).unwrap().is_none());
    }

    #[test]
    fn test_validation_requires_model_and_max_tokens() {
        let err = AnthropicChatFlavor::validate_parameters(&Params::new()).unwrap_err();
        assert!(err.to_string().contains("model"));

        let mut params = Params::new();
        params.insert("model".to_string(), json!("claude-3-opus"));
        let err = AnthropicChatFlavor::validate_parameters(&params).unwrap_err();
        assert!(err.to_string().contains("max_tokens"));

        params.insert("max_tokens".to_string(), json!(256));
        assert!(AnthropicChatFlavor::validate_parameters(&params).is_ok());

        params.insert("prompt".to_string(), json!("nope"));
        let err = AnthropicChatFlavor::validate_parameters(&params).unwrap_err();
        assert!(matches!(err, Error::Client(_)));
    }

    #[test]
    fn test_request_body_extracts_system_message() {
        let mut params = Params::new();
        params.insert("model".to_string(), json!("claude-3-opus"));
        let messages = vec![
            Message::new("system", "be terse"),
            Message::new("user", "hi"),
        ];

        let body = AnthropicChatFlavor::request_body(&messages, &params, false).unwrap();
        assert_eq!(body["system"], json!("be terse"));
        assert_eq!(body["messages"], json!([{"role": "user", "content": "hi"}]));
    }
}
