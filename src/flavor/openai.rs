//! OpenAI chat completions flavor and its delta-only stream parser.
//!
//! Streaming wire format: each line is either blank or `data: <json>`,
//! with a literal `data: [DONE]` sentinel terminating the stream. See
//! <https://platform.openai.com/docs/api-reference/chat/streaming>.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::flavor::{ChatFlavor, ChunkStream};
use crate::http;
use crate::model::{ChatCompletion, IndexedMessage, Message, Provider};
use crate::options::{HttpOptions, OpenAiConfig, ProviderConfigs};
use crate::params::Params;
use crate::sse::LineStreamExt;

pub(crate) const FORMAT_TYPE: &str = "openai_chat";
const DEFAULT_API_BASE: &str = "https://api.openai.com";

/// The `openai_chat` flavor.
pub struct OpenAiChatFlavor;

impl OpenAiChatFlavor {
    fn config<'a>(providers: &'a ProviderConfigs) -> Result<&'a OpenAiConfig> {
        providers.openai.as_ref().ok_or_else(|| {
            Error::Config(
                "the OpenAI provider is not configured; set it up to call OpenAI endpoints"
                    .to_string(),
            )
        })
    }

    fn validate_parameters(parameters: &Params) -> Result<()> {
        if !parameters.contains_key("model") {
            return Err(Error::Client(
                "the 'model' parameter is required when calling OpenAI".to_string(),
            ));
        }
        for forbidden in ["prompt", "messages"] {
            if parameters.contains_key(forbidden) {
                return Err(Error::Client(format!(
                    "the '{forbidden}' parameter cannot be specified; it is populated automatically"
                )));
            }
        }
        Ok(())
    }

    fn request_body(messages: &[Message], parameters: &Params, stream: bool) -> Result<Value> {
        let mut body = parameters.clone();
        body.insert("messages".to_string(), serde_json::to_value(messages)?);
        if stream {
            body.insert("stream".to_string(), Value::Bool(true));
        }
        Ok(Value::Object(body))
    }

    fn url(config: &OpenAiConfig) -> String {
        let base = config.base_url.as_deref().unwrap_or(DEFAULT_API_BASE);
        format!("{base}/v1/chat/completions")
    }
}

#[async_trait]
impl ChatFlavor for OpenAiChatFlavor {
    fn format_type(&self) -> &'static str {
        FORMAT_TYPE
    }

    fn provider(&self) -> Provider {
        Provider::OpenAi
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
            .bearer_auth(config.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(http::status_error(status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Server(format!("error parsing OpenAI response: {e}")))?;
        if parsed.choices.is_empty() {
            return Err(Error::Server(
                "did not get any choices back from OpenAI".to_string(),
            ));
        }

        let choices = parsed
            .choices
            .into_iter()
            .map(|choice| {
                let is_complete = choice.finish_reason.as_deref() == Some("stop");
                IndexedMessage::new(
                    choice.message.role,
                    choice.message.content.unwrap_or_default(),
                    choice.index,
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
            .bearer_auth(config.api_key.expose_secret())
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
            // The role arrives once, on the first delta that carries it.
            let mut role: Option<String> = None;
            while let Some(line) = lines.next().await {
                match parse_stream_line(&line?, &mut role)? {
                    LineOutcome::Chunk(chunk) => yield chunk,
                    LineOutcome::Done => break,
                    LineOutcome::Skip => {}
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Debug)]
pub(crate) enum LineOutcome {
    Chunk(IndexedMessage),
    Done,
    Skip,
}

/// Advance the delta-only parser by one wire line.
///
/// A payload whose delta carries no content but whose finish reason is
/// present yields an empty terminal chunk. A delta with both content and
/// a finish reason yields a single terminal chunk that keeps the content,
/// so every finished stream ends in exactly one terminal chunk.
pub(crate) fn parse_stream_line(
    line: &str,
    remembered_role: &mut Option<String>,
) -> Result<LineOutcome> {
    if line.trim().is_empty() {
        return Ok(LineOutcome::Skip);
    }

    let (field, value) = line
        .split_once(':')
        .ok_or_else(|| Error::Protocol(format!("got unknown line in the stream: '{line}'")))?;
    if field != "data" {
        return Err(Error::Protocol(format!(
            "got unknown line in the stream: '{line}'"
        )));
    }

    let value = value.trim();
    if value == "[DONE]" {
        return Ok(LineOutcome::Done);
    }

    let payload: StreamPayload = serde_json::from_str(value)
        .map_err(|e| Error::Protocol(format!("error processing OpenAI stream: {e}")))?;
    let choice = payload
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::Protocol("stream payload carried no choices".to_string()))?;

    if let Some(role) = choice.delta.role {
        *remembered_role = Some(role);
    }
    let is_complete = choice.finish_reason.as_deref() == Some("stop");
    let is_last = choice.finish_reason.is_some();
    let content = choice.delta.content.unwrap_or_default();

    Ok(LineOutcome::Chunk(IndexedMessage::new(
        remembered_role.clone().unwrap_or_default(),
        content,
        0,
        is_complete,
        is_last,
    )))
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    index: u32,
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    role: String,
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamPayload {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    role: Option<String>,
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(outcome: LineOutcome) -> IndexedMessage {
        match outcome {
            LineOutcome::Chunk(c) => c,
            _ => panic!("expected a chunk"),
        }
    }

    #[test]
    fn test_delta_stream_aggregates_in_order() {
        let lines = [
            r#"data: {"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"Well "}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"hello"}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"length"}]}"#,
        ];

        let mut role = None;
        let mut aggregated = String::new();
        let mut last = None;
        for line in lines {
            let c = chunk(parse_stream_line(line, &mut role).unwrap());
            aggregated.push_str(&c.content);
            last = Some(c);
        }

        assert_eq!(aggregated, "Well hello");
        let last = last.unwrap();
        assert_eq!(last.role, "assistant");
        // finish_reason was "length", so the stream ended but the model
        // did not reach a natural stop.
        assert!(last.is_last);
        assert!(!last.is_complete);
    }

    #[test]
    fn test_delta_with_content_and_finish_reason_is_terminal() {
        let line = r#"data: {"choices":[{"delta":{"content":"bye"},"finish_reason":"stop"}]}"#;
        let c = chunk(parse_stream_line(line, &mut Some("assistant".into())).unwrap());
        assert_eq!(c.content, "bye");
        assert!(c.is_last);
        assert!(c.is_complete);
    }

    #[test]
    fn test_done_sentinel_and_blank_lines() {
        let mut role = None;
        assert!(matches!(
            parse_stream_line("data: [DONE]", &mut role).unwrap(),
            LineOutcome::Done
        ));
        assert!(matches!(
            parse_stream_line("", &mut role).unwrap(),
            LineOutcome::Skip
        ));
        assert!(matches!(
            parse_stream_line("   ", &mut role).unwrap(),
            LineOutcome::Skip
        ));
    }

    #[test]
    fn test_unknown_line_is_a_protocol_error() {
        let mut role = None;
        let err = parse_stream_line("event: message", &mut role).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let err = parse_stream_line("garbage without a colon", &mut role).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_validation_requires_model() {
        let err = OpenAiChatFlavor::validate_parameters(&Params::new()).unwrap_err();
        assert!(matches!(err, Error::Client(_)));
        assert!(err.to_string().contains("model"));
    }

    #[test]
    fn test_validation_forbids_populated_fields() {
        for field in ["prompt", "messages"] {
            let mut params = Params::new();
            params.insert("model".to_string(), json!("gpt-4"));
            params.insert(field.to_string(), json!("nope"));
            let err = OpenAiChatFlavor::validate_parameters(&params).unwrap_err();
            assert!(matches!(err, Error::Client(_)));
            assert!(err.to_string().contains(field));
        }
    }

    #[test]
    fn test_request_body_shape() {
        let mut params = Params::new();
        params.insert("model".to_string(), json!("gpt-4"));
        params.insert("max_tokens".to_string(), json!(64));
        let messages = vec![Message::new("user", "hi")];

        let body = OpenAiChatFlavor::request_body(&messages, &params, true).unwrap();
        assert_eq!(body["model"], json!("gpt-4"));
        assert_eq!(body["max_tokens"], json!(64));
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["messages"], json!([{"role": "user", "content": "hi"}]));

        let body = OpenAiChatFlavor::request_body(&messages, &params, false).unwrap();
        assert!(body.get("stream").is_none());
    }
}
