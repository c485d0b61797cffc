//! HTTP client construction and platform request helpers.

use reqwest::{Client, Response, StatusCode};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::options::{HttpOptions, SecretString};

/// User agent attached to every platform and provider request.
pub(crate) const USER_AGENT: &str = concat!("relai/", env!("CARGO_PKG_VERSION"));

/// Build a configured HTTP client from the shared options.
pub fn build_http_client(options: &HttpOptions) -> Result<Client> {
    let mut builder = Client::builder().user_agent(USER_AGENT);

    if let Some(timeout) = options.timeout {
        builder = builder.timeout(timeout);
    }

    if let Some(proxy_url) = &options.proxy {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| Error::Config(format!("invalid proxy URL '{proxy_url}': {e}")))?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

/// POST a JSON body to a platform endpoint with bearer auth.
pub async fn post_json(
    client: &Client,
    url: &str,
    api_key: &SecretString,
    body: &Value,
) -> Result<Response> {
    let response = client
        .post(url)
        .bearer_auth(api_key.expose_secret())
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .json(body)
        .send()
        .await?;
    Ok(response)
}

/// GET a platform endpoint with bearer auth.
pub async fn get(client: &Client, url: &str, api_key: &SecretString) -> Result<Response> {
    let response = client
        .get(url)
        .bearer_auth(api_key.expose_secret())
        .send()
        .await?;
    Ok(response)
}

/// Check a response against the expected status and parse its JSON body.
///
/// Non-2xx statuses map to the error taxonomy by status class before the
/// body shape is ever inspected.
pub async fn expect_json(response: Response, expected: StatusCode) -> Result<Value> {
    let status = response.status();
    if status != expected {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(status, &body));
    }
    let body = response.text().await?;
    serde_json::from_str(&body)
        .map_err(|e| Error::Server(format!("unparseable response body: {e}")))
}

/// Map a non-2xx status to the error taxonomy: 4xx is the caller's
/// fault, anything else the server's. Appends the body's `message` field
/// when one parses out.
pub fn status_error(status: StatusCode, body: &str) -> Error {
    let detail = extract_message(body)
        .map(|m| format!("HTTP {status}: {m}"))
        .unwrap_or_else(|| format!("HTTP {status}"));

    if status.is_client_error() {
        Error::Client(detail)
    } else {
        Error::Server(detail)
    }
}

fn extract_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    if let Some(message) = value.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }
    // Provider error bodies nest the message under "error".
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_build_http_client() {
        let options = HttpOptions::new().with_timeout(Duration::from_secs(30));
        assert!(build_http_client(&options).is_ok());
    }

    #[test]
    fn test_build_http_client_with_proxy() {
        let options = HttpOptions::new().with_proxy("http://proxy.example.com:8080".to_string());
        assert!(build_http_client(&options).is_ok());
    }

    #[test]
    fn test_build_http_client_rejects_bad_proxy() {
        let options = HttpOptions::new().with_proxy("::not a url::".to_string());
        assert!(matches!(build_http_client(&options), Err(Error::Config(_))));
    }

    #[test]
    fn test_status_error_maps_by_class() {
        let err = status_error(StatusCode::BAD_REQUEST, "");
        assert!(matches!(err, Error::Client(_)));

        let err = status_error(StatusCode::INTERNAL_SERVER_ERROR, "");
        assert!(matches!(err, Error::Server(_)));
    }

    #[test]
    fn test_status_error_appends_message() {
        let err = status_error(StatusCode::NOT_FOUND, r#"{"message": "no such project"}"#);
        assert!(err.to_string().contains("no such project"));

        let err = status_error(
            StatusCode::UNAUTHORIZED,
            r#"{"error": {"message": "bad key", "type": "auth"}}"#,
        );
        assert!(err.to_string().contains("bad key"));
    }
}
