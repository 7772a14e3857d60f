//! Client for the remote function evaluation service.
//!
//! The service accepts a JSON POST of `{name, args, kwargs, content}` and
//! answers with `{"value": ...}` on success or `{"error": {"code", "message"}}`
//! when it refuses the call.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::FunctionCall;
use crate::content::ContentEvent;
use crate::errors::FunctionError;

#[async_trait]
pub trait RemoteFunctionClient: Send + Sync {
    /// Invoke `call` remotely. Implementations must give up once `timeout`
    /// has elapsed.
    async fn invoke(
        &self,
        call: &FunctionCall,
        content: &ContentEvent,
        timeout: Duration,
    ) -> Result<Value, FunctionError>;
}

#[derive(Debug, Serialize)]
pub struct RemoteFunctionRequest<'a> {
    pub name: &'a str,
    pub args: &'a [Value],
    pub kwargs: &'a Map<String, Value>,
    pub content: &'a Value,
}

#[derive(Debug, Deserialize)]
pub struct RemoteFunctionResponse {
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub error: Option<RemoteFunctionErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct RemoteFunctionErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// HTTP implementation of [`RemoteFunctionClient`].
#[derive(Clone)]
pub struct HttpRemoteFunctionClient {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpRemoteFunctionClient {
    pub fn new(http_client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteFunctionClient for HttpRemoteFunctionClient {
    async fn invoke(
        &self,
        call: &FunctionCall,
        content: &ContentEvent,
        timeout: Duration,
    ) -> Result<Value, FunctionError> {
        let request = RemoteFunctionRequest {
            name: &call.name,
            args: &call.args,
            kwargs: &call.kwargs,
            content: content.view(),
        };

        let response = self
            .http_client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error(&call.name, timeout, e))?;

        let status = response.status();
        debug!(function = %call.name, status = %status, "Remote function responded");

        if status.is_server_error() {
            return Err(FunctionError::RemoteUnavailable {
                name: call.name.clone(),
                details: format!("status {status}"),
            });
        }

        let body: Option<RemoteFunctionResponse> = response.json().await.ok();

        if status.is_client_error() {
            let (code, details) = match body.and_then(|b| b.error) {
                Some(error) => (error.code, error.message),
                None => (status.as_u16().to_string(), format!("status {status}")),
            };
            return Err(FunctionError::RemoteRejected {
                name: call.name.clone(),
                code,
                details,
            });
        }

        match body {
            Some(RemoteFunctionResponse {
                error: Some(error), ..
            }) => Err(FunctionError::RemoteRejected {
                name: call.name.clone(),
                code: error.code,
                details: error.message,
            }),
            Some(RemoteFunctionResponse { value, .. }) => Ok(value),
            None => Err(FunctionError::RemoteUnavailable {
                name: call.name.clone(),
                details: "response body is not a function result".to_string(),
            }),
        }
    }
}

fn request_error(name: &str, timeout: Duration, e: reqwest::Error) -> FunctionError {
    if e.is_timeout() {
        FunctionError::Timeout {
            name: name.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else {
        FunctionError::RemoteUnavailable {
            name: name.to_string(),
            details: e.to_string(),
        }
    }
}
