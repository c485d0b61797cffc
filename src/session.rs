//! Sessions group related calls under one session id, and chat sessions
//! additionally accumulate conversation history across turns.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_stream::try_stream;
use futures::StreamExt;

use crate::error::{Error, Result};
use crate::flavor::{ChatFlavor, ChunkStream};
use crate::model::{ChatCompletion, CompletionResult, Message, PromptTemplate};
use crate::params::{self, Params};
use crate::support::{CallContext, CallSupport, PromptProcessor};

/// Per-call overrides, all optional.
#[derive(Default)]
pub struct CallOptions {
    /// Highest-precedence parameter source; overrides client-wide and
    /// template-defined values on key collision.
    pub llm_parameters: Params,
    pub flavor: Option<Arc<dyn ChatFlavor>>,
    pub prompt_processor: Option<PromptProcessor>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_llm_parameters(mut self, llm_parameters: Params) -> Self {
        self.llm_parameters = llm_parameters;
        self
    }

    pub fn with_flavor(mut self, flavor: Arc<dyn ChatFlavor>) -> Self {
        self.flavor = Some(flavor);
        self
    }

    pub fn with_prompt_processor(mut self, prompt_processor: PromptProcessor) -> Self {
        self.prompt_processor = Some(prompt_processor);
        self
    }
}

/// A logical grouping of completion calls sharing one session id.
pub struct CompletionSession {
    support: Arc<CallSupport>,
    project_id: String,
    session_id: String,
    tag: String,
    test_run_id: Option<String>,
    custom_metadata: Params,
}

impl CompletionSession {
    pub(crate) fn new(
        support: Arc<CallSupport>,
        project_id: String,
        tag: String,
        test_run_id: Option<String>,
        custom_metadata: Params,
    ) -> Self {
        Self {
            support,
            project_id,
            session_id: CallSupport::create_session_id(),
            tag,
            test_run_id,
            custom_metadata,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn call_context(&self, variables: &Params) -> CallContext {
        CallContext {
            session_id: self.session_id.clone(),
            tag: self.tag.clone(),
            test_run_id: self.test_run_id.clone(),
            variables: variables.clone(),
            custom_metadata: self.custom_metadata.clone(),
        }
    }

    /// Resolve the named template, call the model once, and record.
    pub async fn get_completion(
        &self,
        template_name: &str,
        variables: &Params,
        options: CallOptions,
    ) -> Result<CompletionResult> {
        let templates = self.support.get_prompts(&self.project_id, &self.tag).await?;
        self.support
            .prepare_and_make_call(
                &self.call_context(variables),
                &templates,
                template_name,
                &options.llm_parameters,
                options.flavor,
                options.prompt_processor,
            )
            .await
    }

    /// Streaming variant of [`get_completion`](Self::get_completion).
    pub async fn get_completion_stream(
        &self,
        template_name: &str,
        variables: &Params,
        options: CallOptions,
    ) -> Result<ChunkStream> {
        let templates = self.support.get_prompts(&self.project_id, &self.tag).await?;
        let template = Self::require_prompt(&templates, template_name, &self.tag)?;
        self.support
            .make_call_stream(
                &self.call_context(variables),
                template,
                &options.llm_parameters,
                options.flavor,
                options.prompt_processor,
            )
            .await
    }

    fn require_prompt<'a>(
        templates: &'a [PromptTemplate],
        template_name: &str,
        tag: &str,
    ) -> Result<&'a PromptTemplate> {
        CallSupport::find_prompt(templates, template_name).ok_or_else(|| {
            Error::Config(format!(
                "prompt template {template_name} in environment {tag} not found"
            ))
        })
    }
}

impl fmt::Debug for CompletionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSession")
            .field("project_id", &self.project_id)
            .field("session_id", &self.session_id)
            .field("tag", &self.tag)
            .field("test_run_id", &self.test_run_id)
            .field("custom_metadata", &self.custom_metadata)
            .finish_non_exhaustive()
    }
}

/// A started chat: the session, the formatted opening prompt, and the
/// first response (a completion, or a stream still being drained).
pub struct ChatStart<R> {
    pub session: ChatSession,
    pub prompt_messages: Vec<Message>,
    pub response: R,
}

impl<R: fmt::Debug> fmt::Debug for ChatStart<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatStart")
            .field("session", &self.session)
            .field("prompt_messages", &self.prompt_messages)
            .field("response", &self.response)
            .finish()
    }
}

/// A multi-turn conversation bound to one resolved template.
///
/// History holds plain messages only; streamed chunks are down-cast
/// before they enter it.
pub struct ChatSession {
    support: Arc<CallSupport>,
    session_id: String,
    tag: String,
    test_run_id: Option<String>,
    custom_metadata: Params,
    template: PromptTemplate,
    variables: Params,
    history: Arc<Mutex<Vec<Message>>>,
}

impl fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatSession")
            .field("session_id", &self.session_id)
            .field("tag", &self.tag)
            .field("test_run_id", &self.test_run_id)
            .field("custom_metadata", &self.custom_metadata)
            .field("template", &self.template)
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

impl ChatSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn start(
        support: Arc<CallSupport>,
        project_id: String,
        tag: String,
        test_run_id: Option<String>,
        custom_metadata: Params,
        template_name: &str,
        variables: Params,
        options: CallOptions,
    ) -> Result<ChatStart<ChatCompletion>> {
        params::validate_scalar_map(&custom_metadata)?;
        let templates = support.get_prompts(&project_id, &tag).await?;
        let template =
            CompletionSession::require_prompt(&templates, template_name, &tag)?.clone();

        let active_flavor = support.active_flavor(options.flavor.clone(), &template)?;
        let prompt_messages = active_flavor.format_prompt(&template.content, &variables)?;

        let session = Self {
            support: support.clone(),
            session_id: CallSupport::create_session_id(),
            tag,
            test_run_id,
            custom_metadata,
            template,
            variables,
            history: Arc::new(Mutex::new(prompt_messages.clone())),
        };

        let response = support
            .make_continue_chat_call(
                &session.call_context(),
                &session.template,
                &prompt_messages,
                &options.llm_parameters,
                options.flavor,
                options.prompt_processor,
            )
            .await?;
        if let Some(first) = response.first_choice() {
            session.lock_history().push(first.to_message());
        }

        Ok(ChatStart {
            session,
            prompt_messages,
            response,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn start_stream(
        support: Arc<CallSupport>,
        project_id: String,
        tag: String,
        test_run_id: Option<String>,
        custom_metadata: Params,
        template_name: &str,
        variables: Params,
        options: CallOptions,
    ) -> Result<ChatStart<ChunkStream>> {
        params::validate_scalar_map(&custom_metadata)?;
        let templates = support.get_prompts(&project_id, &tag).await?;
        let template =
            CompletionSession::require_prompt(&templates, template_name, &tag)?.clone();

        let active_flavor = support.active_flavor(options.flavor.clone(), &template)?;
        let prompt_messages = active_flavor.format_prompt(&template.content, &variables)?;

        let session = Self {
            support: support.clone(),
            session_id: CallSupport::create_session_id(),
            tag,
            test_run_id,
            custom_metadata,
            template,
            variables,
            history: Arc::new(Mutex::new(prompt_messages.clone())),
        };

        let inner = support
            .make_call_stream(
                &session.call_context(),
                &session.template,
                &options.llm_parameters,
                options.flavor,
                options.prompt_processor,
            )
            .await?;
        let response = append_assistant_on_terminal(session.history.clone(), inner);

        Ok(ChatStart {
            session,
            prompt_messages,
            response,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Snapshot of the accumulated conversation.
    pub fn message_history(&self) -> Vec<Message> {
        self.lock_history().clone()
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn call_context(&self) -> CallContext {
        CallContext {
            session_id: self.session_id.clone(),
            tag: self.tag.clone(),
            test_run_id: self.test_run_id.clone(),
            variables: self.variables.clone(),
            custom_metadata: self.custom_metadata.clone(),
        }
    }

    /// Append the new messages, resubmit the full history, and append the
    /// first choice of the response before returning it.
    pub async fn continue_chat(
        &self,
        new_messages: &[Message],
        options: CallOptions,
    ) -> Result<ChatCompletion> {
        let snapshot = {
            let mut history = self.lock_history();
            history.extend(new_messages.iter().cloned());
            history.clone()
        };

        let response = self
            .support
            .make_continue_chat_call(
                &self.call_context(),
                &self.template,
                &snapshot,
                &options.llm_parameters,
                options.flavor,
                options.prompt_processor,
            )
            .await?;
        if let Some(first) = response.first_choice() {
            self.lock_history().push(first.to_message());
        }
        Ok(response)
    }

    /// Streaming variant of [`continue_chat`](Self::continue_chat). The
    /// assistant turn joins the history only when the terminal chunk is
    /// observed; abandoning the stream leaves history at the user turn.
    pub async fn continue_chat_stream(
        &self,
        new_messages: &[Message],
        options: CallOptions,
    ) -> Result<ChunkStream> {
        let snapshot = {
            let mut history = self.lock_history();
            history.extend(new_messages.iter().cloned());
            history.clone()
        };

        let inner = self
            .support
            .make_continue_chat_call_stream(
                &self.call_context(),
                &self.template,
                &snapshot,
                &options.llm_parameters,
                options.flavor,
                options.prompt_processor,
            )
            .await?;
        Ok(append_assistant_on_terminal(self.history.clone(), inner))
    }
}

/// Wrap a chunk stream so the aggregated assistant message is appended
/// to the shared history exactly when the terminal chunk passes through.
fn append_assistant_on_terminal(
    history: Arc<Mutex<Vec<Message>>>,
    inner: ChunkStream,
) -> ChunkStream {
    Box::pin(try_stream! {
        let mut inner = inner;
        let mut aggregated = String::new();
        while let Some(chunk) = inner.next().await {
            let chunk = chunk?;
            aggregated.push_str(&chunk.content);
            if chunk.is_last {
                let role = if chunk.role.is_empty() {
                    "assistant".to_string()
                } else {
                    chunk.role.clone()
                };
                history
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(Message::new(role, aggregated.clone()));
            }
            yield chunk;
        }
    })
}

/// Handle to a created test run; each test case input spawns a session
/// whose calls carry the run's id.
pub struct TestRun {
    support: Arc<CallSupport>,
    project_id: String,
    environment: String,
    test_run_id: String,
    inputs: Vec<Params>,
}

impl TestRun {
    pub(crate) fn new(
        support: Arc<CallSupport>,
        project_id: String,
        environment: String,
        test_run_id: String,
        inputs: Vec<Params>,
    ) -> Self {
        Self {
            support,
            project_id,
            environment,
            test_run_id,
            inputs,
        }
    }

    pub fn test_run_id(&self) -> &str {
        &self.test_run_id
    }

    /// The test case variable maps fetched when the run was created.
    pub fn inputs(&self) -> &[Params] {
        &self.inputs
    }

    /// Start a session whose every recorded call is tied to this run.
    /// Metadata values must be scalars.
    pub fn create_session(&self, custom_metadata: Params) -> Result<CompletionSession> {
        params::validate_scalar_map(&custom_metadata)?;
        Ok(CompletionSession::new(
            self.support.clone(),
            self.project_id.clone(),
            self.environment.clone(),
            Some(self.test_run_id.clone()),
            custom_metadata,
        ))
    }
}
