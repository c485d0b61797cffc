//! Prompt template resolution and variable substitution.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::http;
use crate::model::{Message, PromptTemplate};
use crate::options::{HttpOptions, SecretString};
use crate::params::Params;

/// Format a template's message list, substituting `{{name}}` placeholders.
///
/// The template content is a JSON array of `{role, content}` entries.
/// Produces one message per entry, in original order. Malformed content
/// is the caller's fault.
pub fn format_template(content: &str, variables: &Params) -> Result<Vec<Message>> {
    #[derive(Deserialize)]
    struct TemplateMessage {
        role: String,
        content: String,
    }

    let entries: Vec<TemplateMessage> = serde_json::from_str(content)
        .map_err(|e| Error::Client(format!("error formatting chat prompt template: {e}")))?;

    Ok(entries
        .into_iter()
        .map(|entry| Message::new(entry.role, substitute(&entry.content, variables)))
        .collect())
}

/// Replace `{{name}}` placeholders from the variable map.
///
/// Unmatched placeholders render as the empty string. Scalar values
/// render directly; structured values render as compact JSON.
pub fn substitute(text: &str, variables: &Params) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let name = after_open[..close].trim();
                if let Some(value) = variables.get(name) {
                    out.push_str(&render_value(value));
                }
                rest = &after_open[close + 2..];
            }
            None => {
                // Unterminated placeholder, emit the remainder verbatim.
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        structured => structured.to_string(),
    }
}

/// Source of prompt templates for one project/environment pair.
#[async_trait]
pub trait TemplateResolver: Send + Sync {
    async fn get_prompts(&self, project_id: &str, environment: &str)
        -> Result<Vec<PromptTemplate>>;
}

// Wire shape shared by the API payload and filesystem template files.
#[derive(Deserialize)]
struct TemplatesPayload {
    prompt_templates: Vec<TemplateEntry>,
}

#[derive(Deserialize)]
struct TemplateEntry {
    prompt_template_name: String,
    content: Value,
    metadata: TemplateMetadata,
    prompt_template_id: String,
    prompt_template_version_id: String,
}

#[derive(Deserialize)]
struct TemplateMetadata {
    #[serde(default)]
    flavor: Option<String>,
    #[serde(default)]
    model: Option<Value>,
    #[serde(default)]
    params: Params,
}

impl TemplateEntry {
    fn into_template(self) -> Result<PromptTemplate> {
        let mut llm_parameters = self.metadata.params;
        // The model lives in template metadata but merges like any other
        // parameter.
        if let Some(model) = self.metadata.model {
            llm_parameters.insert("model".to_string(), model);
        }
        Ok(PromptTemplate {
            name: self.prompt_template_name,
            content: serde_json::to_string(&self.content)?,
            flavor_name: self.metadata.flavor.unwrap_or_default(),
            project_version_id: self.prompt_template_version_id.clone(),
            prompt_template_id: self.prompt_template_id,
            prompt_template_version_id: self.prompt_template_version_id,
            llm_parameters,
        })
    }
}

/// Resolves templates from the remote collection platform.
pub struct ApiTemplateResolver {
    base_url: String,
    api_key: SecretString,
    http_options: HttpOptions,
}

impl ApiTemplateResolver {
    pub fn new(base_url: String, api_key: SecretString, http_options: HttpOptions) -> Self {
        Self {
            base_url,
            api_key,
            http_options,
        }
    }
}

#[async_trait]
impl TemplateResolver for ApiTemplateResolver {
    async fn get_prompts(
        &self,
        project_id: &str,
        environment: &str,
    ) -> Result<Vec<PromptTemplate>> {
        let url = format!(
            "{}/v2/projects/{}/prompt-templates/all/{}",
            self.base_url, project_id, environment
        );
        let client = http::build_http_client(&self.http_options)?;
        let response = http::get(&client, &url, &self.api_key).await?;
        let body = http::expect_json(response, reqwest::StatusCode::OK).await?;

        let payload: TemplatesPayload = serde_json::from_value(body)
            .map_err(|e| Error::Server(format!("error getting prompts: {e}")))?;
        payload
            .prompt_templates
            .into_iter()
            .map(TemplateEntry::into_template)
            .collect()
    }
}

/// Resolves templates from local JSON files laid out as
/// `{root}/{project_id}/{environment}/*.json`.
#[derive(Debug)]
pub struct FilesystemTemplateResolver {
    root: PathBuf,
}

impl FilesystemTemplateResolver {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "path for templates is not a directory: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }
}

#[async_trait]
impl TemplateResolver for FilesystemTemplateResolver {
    async fn get_prompts(
        &self,
        project_id: &str,
        environment: &str,
    ) -> Result<Vec<PromptTemplate>> {
        let dir = self.root.join(project_id).join(environment);
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "no templates for project {} in environment {}: {} is not a directory",
                project_id,
                environment,
                dir.display()
            )));
        }

        let mut templates = Vec::new();
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| Error::Config(format!("unable to read {}: {e}", dir.display())))?;
        for dir_entry in entries {
            let path = dir_entry
                .map_err(|e| Error::Config(format!("unable to read {}: {e}", dir.display())))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("unable to read {}: {e}", path.display())))?;
            let entry: TemplateEntry = serde_json::from_str(&contents).map_err(|e| {
                Error::Config(format!("malformed template file {}: {e}", path.display()))
            })?;
            templates.push(entry.into_template()?);
        }
        Ok(templates)
    }
}
