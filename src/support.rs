//! Call orchestration: parameter merging, flavor selection, invocation
//! timing, stream aggregation, and at-most-once recording per call.

use std::sync::Arc;
use std::time::SystemTime;

use async_stream::try_stream;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::flavor::{self, ChatFlavor, ChunkStream};
use crate::http;
use crate::model::{ChatCompletion, CompletionResult, Message, PromptTemplate, Provider};
use crate::options::{HttpOptions, ProviderConfigs, SecretString};
use crate::params::{self, Params};
use crate::record::{epoch_seconds, CallInfo, PromptInfo, RecordProcessor};
use crate::session::TestRun;
use crate::template::TemplateResolver;

/// The provider identity and merged parameters of the call being
/// prepared, exposed to the prompt processor hook.
pub struct FlavorCallInfo {
    pub provider: Provider,
    pub llm_parameters: Params,
}

/// Caller-supplied pure function applied between formatting and
/// invocation, used to inject or redact content.
pub type PromptProcessor = Arc<dyn Fn(Vec<Message>, &FlavorCallInfo) -> Vec<Message> + Send + Sync>;

/// Per-logical-call context threaded from the session into recording.
#[derive(Clone)]
pub(crate) struct CallContext {
    pub session_id: String,
    pub tag: String,
    pub test_run_id: Option<String>,
    pub variables: Params,
    pub custom_metadata: Params,
}

pub(crate) struct CallSupport {
    api_key: Option<SecretString>,
    base_url: Option<String>,
    provider_configs: ProviderConfigs,
    client_flavor: Option<Arc<dyn ChatFlavor>>,
    client_parameters: Params,
    http_options: HttpOptions,
    record_processor: Arc<dyn RecordProcessor>,
    template_resolver: Arc<dyn TemplateResolver>,
}

impl CallSupport {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        api_key: Option<SecretString>,
        base_url: Option<String>,
        provider_configs: ProviderConfigs,
        client_flavor: Option<Arc<dyn ChatFlavor>>,
        client_parameters: Params,
        http_options: HttpOptions,
        record_processor: Arc<dyn RecordProcessor>,
        template_resolver: Arc<dyn TemplateResolver>,
    ) -> Self {
        Self {
            api_key,
            base_url,
            provider_configs,
            client_flavor,
            client_parameters,
            http_options,
            record_processor,
            template_resolver,
        }
    }

    pub(crate) fn create_session_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub(crate) async fn get_prompts(
        &self,
        project_id: &str,
        environment: &str,
    ) -> Result<Vec<PromptTemplate>> {
        self.template_resolver
            .get_prompts(project_id, environment)
            .await
    }

    pub(crate) fn find_prompt<'a>(
        templates: &'a [PromptTemplate],
        template_name: &str,
    ) -> Option<&'a PromptTemplate> {
        templates.iter().find(|t| t.name == template_name)
    }

    /// Flavor precedence: explicit per-call flavor, else the client-wide
    /// default, else the flavor named by the resolved template.
    pub(crate) fn active_flavor(
        &self,
        call_flavor: Option<Arc<dyn ChatFlavor>>,
        template: &PromptTemplate,
    ) -> Result<Arc<dyn ChatFlavor>> {
        if let Some(flavor) = call_flavor {
            return Ok(flavor);
        }
        if let Some(flavor) = &self.client_flavor {
            return Ok(flavor.clone());
        }
        flavor::flavor_for_name(&template.flavor_name)
    }

    pub(crate) fn merged_parameters(
        &self,
        template: &PromptTemplate,
        call_parameters: &Params,
    ) -> Params {
        params::merge_parameters(
            &template.llm_parameters,
            &self.client_parameters,
            call_parameters,
        )
    }

    fn prompt_info(
        template: &PromptTemplate,
        active_flavor: &dyn ChatFlavor,
        merged_parameters: &Params,
    ) -> PromptInfo {
        PromptInfo {
            prompt_template_version_id: template.prompt_template_version_id.clone(),
            prompt_template_id: template.prompt_template_id.clone(),
            format_type: active_flavor.format_type().to_string(),
            provider: active_flavor.provider().name().to_string(),
            model: model_of(merged_parameters),
            llm_parameters: merged_parameters.clone(),
        }
    }

    fn apply_processor(
        messages: Vec<Message>,
        processor: &Option<PromptProcessor>,
        active_flavor: &dyn ChatFlavor,
        merged_parameters: &Params,
    ) -> Vec<Message> {
        match processor {
            Some(processor) => {
                let call_info = FlavorCallInfo {
                    provider: active_flavor.provider(),
                    llm_parameters: merged_parameters.clone(),
                };
                processor(messages, &call_info)
            }
            None => messages,
        }
    }

    /// Single-shot call path: format, hook, invoke, time, record, attach.
    pub(crate) async fn prepare_and_make_call(
        &self,
        ctx: &CallContext,
        templates: &[PromptTemplate],
        template_name: &str,
        call_parameters: &Params,
        call_flavor: Option<Arc<dyn ChatFlavor>>,
        prompt_processor: Option<PromptProcessor>,
    ) -> Result<CompletionResult> {
        let template = Self::find_prompt(templates, template_name).ok_or_else(|| {
            Error::Config(format!(
                "prompt template {} in environment {} not found",
                template_name, ctx.tag
            ))
        })?;

        let merged = self.merged_parameters(template, call_parameters);
        let active_flavor = self.active_flavor(call_flavor, template)?;

        let formatted = active_flavor.format_prompt(&template.content, &ctx.variables)?;
        let modified =
            Self::apply_processor(formatted, &prompt_processor, active_flavor.as_ref(), &merged);

        let start = SystemTime::now();
        let mut response = active_flavor
            .call_service(&modified, &self.provider_configs, &merged, &self.http_options)
            .await?;
        let end = SystemTime::now();

        let completion_id = self
            .record_processor
            .record(
                &Self::prompt_info(template, active_flavor.as_ref(), &merged),
                &CallInfo {
                    session_id: ctx.session_id.clone(),
                    test_run_id: ctx.test_run_id.clone(),
                    start_time: epoch_seconds(start),
                    end_time: epoch_seconds(end),
                    tag: ctx.tag.clone(),
                    inputs: ctx.variables.clone(),
                    custom_metadata: ctx.custom_metadata.clone(),
                    prompt_content: active_flavor.serialize_for_record(&modified)?,
                    return_content: response.content.clone(),
                    is_complete: response.is_complete,
                },
            )
            .await;
        response.completion_id = completion_id;

        Ok(response)
    }

    /// Streaming call path. The returned sequence is single-pass and
    /// forward-only; the recording wrapper fires exactly once, when the
    /// terminal chunk passes through to whoever is draining it.
    pub(crate) async fn make_call_stream(
        &self,
        ctx: &CallContext,
        template: &PromptTemplate,
        call_parameters: &Params,
        call_flavor: Option<Arc<dyn ChatFlavor>>,
        prompt_processor: Option<PromptProcessor>,
    ) -> Result<ChunkStream> {
        let merged = self.merged_parameters(template, call_parameters);
        let active_flavor = self.active_flavor(call_flavor, template)?;

        let formatted = active_flavor.format_prompt(&template.content, &ctx.variables)?;
        let modified =
            Self::apply_processor(formatted, &prompt_processor, active_flavor.as_ref(), &merged);

        let start = SystemTime::now();
        let inner = active_flavor
            .call_service_stream(&modified, &self.provider_configs, &merged, &self.http_options)
            .await?;

        Ok(record_on_terminal(
            self.record_processor.clone(),
            active_flavor.clone(),
            Self::prompt_info(template, active_flavor.as_ref(), &merged),
            ctx.clone(),
            active_flavor.serialize_for_record(&modified)?,
            start,
            inner,
        ))
    }

    /// Continuation call: the message list is the full accumulated
    /// history rather than a freshly formatted template.
    pub(crate) async fn make_continue_chat_call(
        &self,
        ctx: &CallContext,
        template: &PromptTemplate,
        messages: &[Message],
        call_parameters: &Params,
        call_flavor: Option<Arc<dyn ChatFlavor>>,
        prompt_processor: Option<PromptProcessor>,
    ) -> Result<ChatCompletion> {
        let merged = self.merged_parameters(template, call_parameters);
        let active_flavor = self.active_flavor(call_flavor, template)?;

        let final_messages = Self::apply_processor(
            messages.to_vec(),
            &prompt_processor,
            active_flavor.as_ref(),
            &merged,
        );

        let start = SystemTime::now();
        let mut response = active_flavor
            .call_chat_service(&final_messages, &self.provider_configs, &merged, &self.http_options)
            .await?;
        let end = SystemTime::now();

        let completion_id = self
            .record_processor
            .record(
                &Self::prompt_info(template, active_flavor.as_ref(), &merged),
                &CallInfo {
                    session_id: ctx.session_id.clone(),
                    test_run_id: ctx.test_run_id.clone(),
                    start_time: epoch_seconds(start),
                    end_time: epoch_seconds(end),
                    tag: ctx.tag.clone(),
                    inputs: ctx.variables.clone(),
                    custom_metadata: ctx.custom_metadata.clone(),
                    prompt_content: active_flavor.serialize_for_record(&final_messages)?,
                    return_content: response.content().to_string(),
                    is_complete: response.is_complete(),
                },
            )
            .await;
        response.completion_id = completion_id;

        Ok(response)
    }

    pub(crate) async fn make_continue_chat_call_stream(
        &self,
        ctx: &CallContext,
        template: &PromptTemplate,
        messages: &[Message],
        call_parameters: &Params,
        call_flavor: Option<Arc<dyn ChatFlavor>>,
        prompt_processor: Option<PromptProcessor>,
    ) -> Result<ChunkStream> {
        let merged = self.merged_parameters(template, call_parameters);
        let active_flavor = self.active_flavor(call_flavor, template)?;

        let final_messages = Self::apply_processor(
            messages.to_vec(),
            &prompt_processor,
            active_flavor.as_ref(),
            &merged,
        );

        let start = SystemTime::now();
        let inner = active_flavor
            .call_service_stream(
                &final_messages,
                &self.provider_configs,
                &merged,
                &self.http_options,
            )
            .await?;

        Ok(record_on_terminal(
            self.record_processor.clone(),
            active_flavor.clone(),
            Self::prompt_info(template, active_flavor.as_ref(), &merged),
            ctx.clone(),
            active_flavor.serialize_for_record(&final_messages)?,
            start,
            inner,
        ))
    }

    pub(crate) async fn create_test_run(
        self: Arc<Self>,
        project_id: &str,
        environment: &str,
        test_list_name: &str,
    ) -> Result<TestRun> {
        let (base_url, api_key) = self.platform_credentials()?;
        let url = format!("{base_url}/v2/projects/{project_id}/test-runs");
        let client = http::build_http_client(&self.http_options)?;
        let response = http::post_json(
            &client,
            &url,
            api_key,
            &json!({ "playlist_name": test_list_name }),
        )
        .await
        .map_err(|e| Error::Server(format!("error creating test run: {e}")))?;
        let body = http::expect_json(response, reqwest::StatusCode::CREATED).await?;

        let test_run_id = body
            .get("test_run_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Server("test run response missing test_run_id".to_string()))?
            .to_string();
        let inputs = body
            .get("inputs")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_object().cloned())
                    .collect()
            })
            .unwrap_or_default();

        Ok(TestRun::new(
            self,
            project_id.to_string(),
            environment.to_string(),
            test_run_id,
            inputs,
        ))
    }

    pub(crate) async fn record_feedback(
        &self,
        project_id: &str,
        completion_id: &str,
        feedback: &Params,
    ) -> Result<()> {
        params::validate_scalar_map(feedback)?;

        let (base_url, api_key) = self.platform_credentials()?;
        let url =
            format!("{base_url}/v2/projects/{project_id}/completion-feedback/id/{completion_id}");
        let client = http::build_http_client(&self.http_options)?;
        let response =
            http::post_json(&client, &url, api_key, &Value::Object(feedback.clone())).await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(http::status_error(status, &text));
        }
        Ok(())
    }

    fn platform_credentials(&self) -> Result<(&String, &SecretString)> {
        match (&self.base_url, &self.api_key) {
            (Some(base_url), Some(api_key)) => Ok((base_url, api_key)),
            _ => Err(Error::Config(
                "platform API key and base URL are required for this operation".to_string(),
            )),
        }
    }
}

fn model_of(parameters: &Params) -> String {
    match parameters.get("model") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Wrap a chunk stream so that observing the terminal chunk triggers the
/// timing/record/attach sequence, synchronously at that point of
/// consumption. A stream that is never fully drained never records.
fn record_on_terminal(
    record_processor: Arc<dyn RecordProcessor>,
    active_flavor: Arc<dyn ChatFlavor>,
    prompt_info: PromptInfo,
    ctx: CallContext,
    prompt_content: String,
    start: SystemTime,
    inner: ChunkStream,
) -> ChunkStream {
    Box::pin(try_stream! {
        let mut inner = inner;
        let mut aggregated = String::new();
        while let Some(chunk) = inner.next().await {
            let mut chunk = chunk?;
            aggregated.push_str(active_flavor.content_of(&chunk));
            if active_flavor.is_last_chunk(&chunk) {
                let call_info = CallInfo {
                    session_id: ctx.session_id.clone(),
                    test_run_id: ctx.test_run_id.clone(),
                    start_time: epoch_seconds(start),
                    end_time: epoch_seconds(SystemTime::now()),
                    tag: ctx.tag.clone(),
                    inputs: ctx.variables.clone(),
                    custom_metadata: ctx.custom_metadata.clone(),
                    prompt_content: prompt_content.clone(),
                    return_content: aggregated.clone(),
                    is_complete: active_flavor.is_complete(&chunk),
                };
                if let Some(id) = record_processor.record(&prompt_info, &call_info).await {
                    chunk.completion_id = Some(id);
                }
            }
            yield chunk;
        }
    })
}
