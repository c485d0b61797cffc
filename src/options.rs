//! Configuration structures for providers and HTTP transport.

use std::time::Duration;

/// A secret string type for sensitive data like API keys.
/// Prevents accidental logging or display of secrets.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    /// Create a new secret string.
    pub fn new(s: String) -> Self {
        Self(s)
    }

    /// Get the underlying secret value.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString([REDACTED])")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

/// HTTP options applied to every outbound request, platform and provider
/// alike.
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    /// Request timeout.
    pub timeout: Option<Duration>,

    /// HTTP proxy URL.
    pub proxy: Option<String>,
}

impl HttpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the proxy URL.
    pub fn with_proxy(mut self, proxy: String) -> Self {
        self.proxy = Some(proxy);
        self
    }
}

/// Credentials and endpoint override for the OpenAI API.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: SecretString,
    /// Override of the default `https://api.openai.com` endpoint.
    pub base_url: Option<String>,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<SecretString>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }
}

/// Credentials and endpoint override for the Anthropic API.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: SecretString,
    /// Override of the default `https://api.anthropic.com` endpoint.
    pub base_url: Option<String>,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<SecretString>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }
}

/// Per-provider configuration. A flavor fails with a configuration error
/// if its provider is not set up here.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfigs {
    pub openai: Option<OpenAiConfig>,
    pub anthropic: Option<AnthropicConfig>,
}

impl ProviderConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_openai(mut self, config: OpenAiConfig) -> Self {
        self.openai = Some(config);
        self
    }

    pub fn with_anthropic(mut self, config: AnthropicConfig) -> Self {
        self.anthropic = Some(config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_string_redacted_debug() {
        let secret = SecretString::new("sk-very-secret".to_string());
        assert_eq!(format!("{:?}", secret), "SecretString([REDACTED])");
        assert_eq!(secret.expose_secret(), "sk-very-secret");
    }

    #[test]
    fn test_provider_configs_builder() {
        let configs = ProviderConfigs::new()
            .with_openai(OpenAiConfig::new("sk-1").with_base_url("http://localhost:1".to_string()))
            .with_anthropic(AnthropicConfig::new("sk-2"));
        assert_eq!(
            configs.openai.as_ref().unwrap().base_url.as_deref(),
            Some("http://localhost:1")
        );
        assert!(configs.anthropic.as_ref().unwrap().base_url.is_none());
    }
}
