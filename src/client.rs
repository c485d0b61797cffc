//! Client configuration and the top-level entry point.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::flavor::{ChatFlavor, ChunkStream};
use crate::model::{ChatCompletion, CompletionResult};
use crate::options::{HttpOptions, ProviderConfigs, SecretString};
use crate::params::{self, Params};
use crate::record::{HttpRecordProcessor, NoRecordProcessor, RecordProcessor};
use crate::session::{CallOptions, ChatSession, ChatStart, CompletionSession, TestRun};
use crate::support::CallSupport;
use crate::template::{ApiTemplateResolver, TemplateResolver};

/// Builder for [`Relai`]. Everything is optional except that a template
/// resolver must be derivable: either supply one, or set both the
/// platform API key and base URL.
#[derive(Default)]
pub struct Config {
    api_key: Option<SecretString>,
    base_url: Option<String>,
    provider_configs: ProviderConfigs,
    flavor: Option<Arc<dyn ChatFlavor>>,
    llm_parameters: Params,
    http_options: HttpOptions,
    record_processor: Option<Arc<dyn RecordProcessor>>,
    template_resolver: Option<Arc<dyn TemplateResolver>>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform API key, used for template resolution, recording,
    /// test runs, and feedback.
    pub fn with_api_key(mut self, api_key: impl Into<SecretString>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Platform base URL, without a trailing slash.
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn with_provider_configs(mut self, provider_configs: ProviderConfigs) -> Self {
        self.provider_configs = provider_configs;
        self
    }

    /// Client-wide default flavor, overriding what templates declare.
    pub fn with_flavor(mut self, flavor: Arc<dyn ChatFlavor>) -> Self {
        self.flavor = Some(flavor);
        self
    }

    /// Client-wide parameters; override template values, are overridden
    /// by per-call values.
    pub fn with_llm_parameters(mut self, llm_parameters: Params) -> Self {
        self.llm_parameters = llm_parameters;
        self
    }

    pub fn with_http_options(mut self, http_options: HttpOptions) -> Self {
        self.http_options = http_options;
        self
    }

    pub fn with_record_processor(mut self, record_processor: Arc<dyn RecordProcessor>) -> Self {
        self.record_processor = Some(record_processor);
        self
    }

    pub fn with_template_resolver(mut self, template_resolver: Arc<dyn TemplateResolver>) -> Self {
        self.template_resolver = Some(template_resolver);
        self
    }

    pub fn build(self) -> Result<Relai> {
        let template_resolver = match self.template_resolver {
            Some(resolver) => resolver,
            None => match (&self.base_url, &self.api_key) {
                (Some(base_url), Some(api_key)) => Arc::new(ApiTemplateResolver::new(
                    base_url.clone(),
                    api_key.clone(),
                    self.http_options.clone(),
                )),
                _ => {
                    return Err(Error::Config(
                        "a template resolver is required; provide one, or set both the API key \
                         and base URL to use the platform resolver"
                            .to_string(),
                    ))
                }
            },
        };

        let record_processor = match self.record_processor {
            Some(processor) => processor,
            None => match (&self.base_url, &self.api_key) {
                (Some(base_url), Some(api_key)) => Arc::new(HttpRecordProcessor::new(
                    base_url.clone(),
                    api_key.clone(),
                    self.http_options.clone(),
                )),
                // Without platform credentials there is nowhere to record.
                _ => Arc::new(NoRecordProcessor) as Arc<dyn RecordProcessor>,
            },
        };

        Ok(Relai {
            support: Arc::new(CallSupport::new(
                self.api_key,
                self.base_url,
                self.provider_configs,
                self.flavor,
                self.llm_parameters,
                self.http_options,
                record_processor,
                template_resolver,
            )),
        })
    }
}

/// The client. Cheap to clone; all state is shared behind an `Arc`.
#[derive(Clone)]
pub struct Relai {
    support: Arc<CallSupport>,
}

impl std::fmt::Debug for Relai {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relai").finish_non_exhaustive()
    }
}

impl Relai {
    /// Start a new session against one project and environment. Calls
    /// made through it share a freshly generated session id. Metadata
    /// values must be scalars; anything else fails here, before any I/O.
    pub fn create_session(
        &self,
        project_id: &str,
        environment: &str,
        custom_metadata: Params,
    ) -> Result<CompletionSession> {
        params::validate_scalar_map(&custom_metadata)?;
        Ok(CompletionSession::new(
            self.support.clone(),
            project_id.to_string(),
            environment.to_string(),
            None,
            custom_metadata,
        ))
    }

    /// One-off completion in a session of its own.
    pub async fn get_completion(
        &self,
        project_id: &str,
        environment: &str,
        template_name: &str,
        variables: &Params,
        options: CallOptions,
    ) -> Result<CompletionResult> {
        self.create_session(project_id, environment, Params::new())?
            .get_completion(template_name, variables, options)
            .await
    }

    /// One-off streamed completion in a session of its own.
    pub async fn get_completion_stream(
        &self,
        project_id: &str,
        environment: &str,
        template_name: &str,
        variables: &Params,
        options: CallOptions,
    ) -> Result<ChunkStream> {
        self.create_session(project_id, environment, Params::new())?
            .get_completion_stream(template_name, variables, options)
            .await
    }

    /// Open a chat: format the template, make the first call, and return
    /// the session with its history already seeded. Metadata values must
    /// be scalars.
    pub async fn start_chat(
        &self,
        project_id: &str,
        environment: &str,
        template_name: &str,
        variables: Params,
        custom_metadata: Params,
        options: CallOptions,
    ) -> Result<ChatStart<ChatCompletion>> {
        ChatSession::start(
            self.support.clone(),
            project_id.to_string(),
            environment.to_string(),
            None,
            custom_metadata,
            template_name,
            variables,
            options,
        )
        .await
    }

    /// Streaming variant of [`start_chat`](Self::start_chat). The
    /// assistant's opening turn joins the history once the returned
    /// stream's terminal chunk is observed.
    pub async fn start_chat_stream(
        &self,
        project_id: &str,
        environment: &str,
        template_name: &str,
        variables: Params,
        custom_metadata: Params,
        options: CallOptions,
    ) -> Result<ChatStart<ChunkStream>> {
        ChatSession::start_stream(
            self.support.clone(),
            project_id.to_string(),
            environment.to_string(),
            None,
            custom_metadata,
            template_name,
            variables,
            options,
        )
        .await
    }

    /// Create a test run from a named test list on the platform.
    pub async fn create_test_run(
        &self,
        project_id: &str,
        environment: &str,
        test_list_name: &str,
    ) -> Result<TestRun> {
        self.support
            .clone()
            .create_test_run(project_id, environment, test_list_name)
            .await
    }

    /// Attach end-user feedback to a previously recorded completion.
    /// Values must be scalars.
    pub async fn record_feedback(
        &self,
        project_id: &str,
        completion_id: &str,
        feedback: &Params,
    ) -> Result<()> {
        self.support
            .record_feedback(project_id, completion_id, feedback)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_a_derivable_resolver() {
        let err = Config::new().build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // Only one of the two platform settings is not enough.
        let err = Config::new().with_api_key("fp-key").build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_build_with_platform_credentials() {
        let client = Config::new()
            .with_api_key("fp-key")
            .with_base_url("https://api.example.com".to_string())
            .build()
            .unwrap();
        drop(client);
    }

    #[test]
    fn test_build_with_custom_resolver_needs_no_credentials() {
        let root = tempfile::tempdir().unwrap();
        let resolver = crate::template::FilesystemTemplateResolver::new(root.path()).unwrap();
        let client = Config::new()
            .with_template_resolver(Arc::new(resolver))
            .build()
            .unwrap();
        drop(client);
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let client = Config::new()
            .with_api_key("fp-key")
            .with_base_url("https://api.example.com".to_string())
            .build()
            .unwrap();
        let a = client.create_session("p", "prod", Params::new()).unwrap();
        let b = client.create_session("p", "prod", Params::new()).unwrap();
        assert_ne!(a.session_id(), b.session_id());
    }

    #[test]
    fn test_create_session_rejects_structured_metadata() {
        let client = Config::new()
            .with_api_key("fp-key")
            .with_base_url("https://api.example.com".to_string())
            .build()
            .unwrap();

        let mut metadata = Params::new();
        metadata.insert("nested".to_string(), serde_json::json!({"a": 1}));
        let err = client.create_session("p", "prod", metadata).unwrap_err();
        assert!(matches!(err, Error::Client(_)));
        assert!(err.to_string().contains("nested"));
    }
}
