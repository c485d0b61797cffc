//! Durable recording of call metadata to the collection platform.
//!
//! Recording is telemetry: it must never break the primary LLM call.
//! The `RecordProcessor` contract is therefore infallible; the default
//! implementation logs failures at warn level and returns `None`, which
//! leaves the completion id unset.

use std::time::SystemTime;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::http;
use crate::options::{HttpOptions, SecretString};
use crate::params::Params;

/// Immutable descriptor of the template version used for one call.
#[derive(Debug, Clone)]
pub struct PromptInfo {
    pub prompt_template_version_id: String,
    pub prompt_template_id: String,
    pub format_type: String,
    pub provider: String,
    pub model: String,
    pub llm_parameters: Params,
}

/// Immutable descriptor of one invocation's timing and payload.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub session_id: String,
    pub test_run_id: Option<String>,
    /// Wall-clock epoch seconds.
    pub start_time: f64,
    pub end_time: f64,
    pub tag: String,
    pub inputs: Params,
    pub custom_metadata: Params,
    pub prompt_content: String,
    pub return_content: String,
    pub is_complete: bool,
}

/// Wall-clock time as fractional epoch seconds, the record wire format.
pub(crate) fn epoch_seconds(time: SystemTime) -> f64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Stores a call's prompt/response/metadata and returns an identifier.
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    /// Record one call. Must not fail: implementations log and return
    /// `None` when the backend is unreachable.
    async fn record(&self, prompt_info: &PromptInfo, call_info: &CallInfo) -> Option<String>;
}

/// The default processor: POSTs to the platform's `v1/record` endpoint.
pub struct HttpRecordProcessor {
    base_url: String,
    api_key: SecretString,
    http_options: HttpOptions,
}

impl HttpRecordProcessor {
    pub fn new(base_url: String, api_key: SecretString, http_options: HttpOptions) -> Self {
        Self {
            base_url,
            api_key,
            http_options,
        }
    }

    fn payload(prompt_info: &PromptInfo, call_info: &CallInfo) -> Value {
        let mut payload = json!({
            "session_id": call_info.session_id,
            "project_version_id": prompt_info.prompt_template_version_id,
            "prompt_template_id": prompt_info.prompt_template_id,
            "start_time": call_info.start_time,
            "end_time": call_info.end_time,
            "tag": call_info.tag,
            "inputs": call_info.inputs,
            "custom_metadata": call_info.custom_metadata,
            "prompt_content": call_info.prompt_content,
            "return_content": call_info.return_content,
            "format_type": prompt_info.format_type,
            "is_complete": call_info.is_complete,
            "provider": prompt_info.provider,
            "model": prompt_info.model,
            "llm_parameters": prompt_info.llm_parameters,
        });
        if let Some(test_run_id) = &call_info.test_run_id {
            payload["test_run_id"] = json!(test_run_id);
        }
        payload
    }

    async fn try_record(
        &self,
        prompt_info: &PromptInfo,
        call_info: &CallInfo,
    ) -> crate::error::Result<Option<String>> {
        let url = format!("{}/v1/record", self.base_url);
        let payload = Self::payload(prompt_info, call_info);
        let client = http::build_http_client(&self.http_options)?;
        let response = http::post_json(&client, &url, &self.api_key, &payload).await?;
        let body = http::expect_json(response, reqwest::StatusCode::OK).await?;
        Ok(body
            .get("completion_id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

#[async_trait]
impl RecordProcessor for HttpRecordProcessor {
    async fn record(&self, prompt_info: &PromptInfo, call_info: &CallInfo) -> Option<String> {
        match self.try_record(prompt_info, call_info).await {
            Ok(completion_id) => completion_id,
            Err(e) => {
                warn!(error = %e, "unable to record LLM call");
                None
            }
        }
    }
}

/// Explicit opt-out that never records.
pub struct NoRecordProcessor;

#[async_trait]
impl RecordProcessor for NoRecordProcessor {
    async fn record(&self, _prompt_info: &PromptInfo, _call_info: &CallInfo) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_prompt_info() -> PromptInfo {
        PromptInfo {
            prompt_template_version_id: "v-1".to_string(),
            prompt_template_id: "t-1".to_string(),
            format_type: "openai_chat".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4".to_string(),
            llm_parameters: Params::new(),
        }
    }

    fn sample_call_info(test_run_id: Option<String>) -> CallInfo {
        CallInfo {
            session_id: "s-1".to_string(),
            test_run_id,
            start_time: 1700000000.5,
            end_time: 1700000001.25,
            tag: "prod".to_string(),
            inputs: Params::new(),
            custom_metadata: Params::new(),
            prompt_content: "[]".to_string(),
            return_content: "hello".to_string(),
            is_complete: true,
        }
    }

    #[test]
    fn test_payload_field_names() {
        let payload =
            HttpRecordProcessor::payload(&sample_prompt_info(), &sample_call_info(None));
        assert_eq!(payload["session_id"], json!("s-1"));
        assert_eq!(payload["project_version_id"], json!("v-1"));
        assert_eq!(payload["prompt_template_id"], json!("t-1"));
        assert_eq!(payload["format_type"], json!("openai_chat"));
        assert_eq!(payload["provider"], json!("openai"));
        assert_eq!(payload["return_content"], json!("hello"));
        assert_eq!(payload["is_complete"], json!(true));
        assert!(payload.get("test_run_id").is_none());
    }

    #[test]
    fn test_payload_includes_test_run_id_when_present() {
        let payload = HttpRecordProcessor::payload(
            &sample_prompt_info(),
            &sample_call_info(Some("run-9".to_string())),
        );
        assert_eq!(payload["test_run_id"], json!("run-9"));
    }

    #[test]
    fn test_epoch_seconds_is_fractional() {
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(1500);
        assert!((epoch_seconds(t) - 1.5).abs() < 1e-9);
    }
}
