use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use std::time::Duration;
use txcore::executor::{config_str, require_str};
use txcore::{ConfigMap, ExecContext, ExecutorError, Params, TaskExecutor, Value};

pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Send a prepared request and return its status and body text
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<(u16, String), ExecutorError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(transport_error)?;
    Ok((status, body))
}

fn transport_error(err: reqwest::Error) -> ExecutorError {
    if err.is_timeout() {
        ExecutorError::Timeout {
            seconds: REQUEST_TIMEOUT.as_secs(),
        }
    } else {
        ExecutorError::Transport(err.to_string())
    }
}

/// Generic outbound HTTP call
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExecutorError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

/// `Content-Type: application/json` unless the config headers set their own
fn headers(config: &ConfigMap) -> Result<HeaderMap, ExecutorError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(serde_json::Value::Object(configured)) = config.get("headers") {
        for (key, value) in configured {
            let Some(value) = value.as_str() else { continue };
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| ExecutorError::Configuration(format!("Invalid header name: {}", key)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ExecutorError::Configuration(format!("Invalid value for header {}", key)))?;
            headers.insert(name, value);
        }
    }
    Ok(headers)
}

/// Request body from input `body`: strings verbatim, structures as JSON
fn request_body(input: &Params) -> Option<String> {
    match input.get("body")? {
        Value::Null => None,
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_json().to_string()),
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    fn task_type(&self) -> &str {
        "http"
    }

    async fn execute(&self, ctx: &ExecContext, config: &ConfigMap, input: &Params) -> Result<(), ExecutorError> {
        let url = require_str(config, "url")?;
        let method_name = config_str(config, "method")
            .filter(|m| !m.is_empty())
            .unwrap_or("POST")
            .to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| ExecutorError::Configuration(format!("Unsupported method: {}", method_name)))?;

        let mut request = self.client.request(method, url).headers(headers(config)?);
        if let Some(body) = request_body(input) {
            request = request.body(body);
        }

        let (status, body) = ctx.guard(send(request)).await?;
        if status >= 400 {
            return Err(ExecutorError::Status { status, body });
        }

        tracing::info!(
            task_id = %ctx.task_id,
            url,
            method = %method_name,
            status,
            body_size = body.len(),
            "HTTP request completed"
        );
        Ok(())
    }
}
