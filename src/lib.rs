//! # relai - Prompt-Driven LLM Client Library
//!
//! A client library for running versioned prompt templates against LLM
//! providers, with streaming and non-streaming calls, multi-turn chat
//! sessions, and recording of every call to a collection platform.
//!
//! ## Features
//! - Async-first, tokio compatible
//! - Provider flavors behind one trait (`openai_chat`, `anthropic_chat`)
//! - Template resolution from the platform API or local files
//! - Three-level parameter merging: template < client < per-call
//! - Streaming via Server-Sent Events, with recording on the terminal chunk
//! - Test runs and completion feedback
//!
//! ## Example
//! ```no_run
//! use relai::{CallOptions, Config, OpenAiConfig, Params, ProviderConfigs};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Config::new()
//!         .with_api_key("fp-key")
//!         .with_base_url("https://api.example.com".to_string())
//!         .with_provider_configs(
//!             ProviderConfigs::new().with_openai(OpenAiConfig::new("sk-your-key")),
//!         )
//!         .build()?;
//!
//!     let session = client.create_session("project-id", "prod", Params::new())?;
//!
//!     let mut variables = Params::new();
//!     variables.insert("name".to_string(), "Ada".into());
//!     let completion = session
//!         .get_completion("greeting", &variables, CallOptions::new())
//!         .await?;
//!     println!("{}", completion.content);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod flavor;
pub mod http;
pub mod model;
pub mod options;
pub mod params;
pub mod record;
pub mod session;
pub mod sse;
pub mod support;
pub mod template;

// Re-exports for convenience
pub use client::{Config, Relai};
pub use error::{Error, Result};
pub use flavor::{flavor_for_name, AnthropicChatFlavor, ChatFlavor, ChunkStream, OpenAiChatFlavor};
pub use model::{ChatCompletion, CompletionResult, IndexedMessage, Message, PromptTemplate, Provider};
pub use options::{AnthropicConfig, HttpOptions, OpenAiConfig, ProviderConfigs, SecretString};
pub use params::Params;
pub use record::{CallInfo, HttpRecordProcessor, NoRecordProcessor, PromptInfo, RecordProcessor};
pub use session::{CallOptions, ChatSession, ChatStart, CompletionSession, TestRun};
pub use support::{FlavorCallInfo, PromptProcessor};
pub use template::{ApiTemplateResolver, FilesystemTemplateResolver, TemplateResolver};
