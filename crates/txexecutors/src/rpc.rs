use crate::http::{send, REQUEST_TIMEOUT};
use async_trait::async_trait;
use serde_json::json;
use txcore::executor::require_str;
use txcore::{params_to_json, ConfigMap, ExecContext, ExecutorError, Params, TaskExecutor};

/// Calls `method` on an internal service through its `/rpc` endpoint
pub struct RpcExecutor {
    client: reqwest::Client,
}

impl RpcExecutor {
    pub fn new() -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExecutorError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

/// `http://{service}/rpc`, unless `service` already names a scheme
fn endpoint(service: &str) -> String {
    let base = if service.contains("://") {
        service.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", service.trim_end_matches('/'))
    };
    format!("{}/rpc", base)
}

#[async_trait]
impl TaskExecutor for RpcExecutor {
    fn task_type(&self) -> &str {
        "rpc"
    }

    async fn execute(&self, ctx: &ExecContext, config: &ConfigMap, input: &Params) -> Result<(), ExecutorError> {
        let service = require_str(config, "service")?;
        let method = require_str(config, "method")?;
        let url = endpoint(service);

        let payload = json!({
            "method": method,
            "params": params_to_json(input),
        });
        let request = self.client.post(&url).json(&payload);
        let (status, body) = ctx.guard(send(request)).await?;
        if !(200..300).contains(&status) {
            return Err(ExecutorError::Status { status, body });
        }

        tracing::info!(
            task_id = %ctx.task_id,
            service,
            method,
            status,
            "RPC call completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults_to_plain_http() {
        assert_eq!(endpoint("payment-svc:8080"), "http://payment-svc:8080/rpc");
        assert_eq!(endpoint("https://pay.internal/"), "https://pay.internal/rpc");
    }

    #[tokio::test]
    async fn incomplete_config_is_rejected() {
        let executor = RpcExecutor::new().unwrap();
        let ctx = ExecContext::new("i1", "i1_t1");
        let mut config = ConfigMap::new();
        config.insert("service".into(), json!("payment-svc"));

        let err = executor.execute(&ctx, &config, &Params::new()).await.unwrap_err();
        assert_eq!(err, ExecutorError::Configuration("Missing config: method".to_string()));
    }
}
