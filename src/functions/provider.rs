//! Function execution strategies.
//!
//! [`FunctionProvider`] is a closed set of strategies:
//!
//! - `Local` runs functions from the startup registry.
//! - `Remote` forwards every call to the remote evaluation service.
//! - `Hybrid` runs locally and falls back to the remote service only when the
//!   function is not registered locally. A local execution failure is final.
//!
//! Every call is bounded by a timeout. Remote calls are also aborted when the
//! service is hard-stopped, which surfaces as `FunctionError::Timeout`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{FunctionCall, FunctionRegistry, RemoteFunctionClient};
use crate::content::ContentEvent;
use crate::errors::FunctionError;

#[derive(Clone, Debug)]
pub struct LocalProvider {
    registry: Arc<FunctionRegistry>,
    timeout: Duration,
}

impl LocalProvider {
    pub fn new(registry: Arc<FunctionRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub async fn resolve(
        &self,
        call: &FunctionCall,
        content: &ContentEvent,
    ) -> Result<Value, FunctionError> {
        let function = self
            .registry
            .get(&call.name)
            .ok_or_else(|| FunctionError::NotFound {
                name: call.name.clone(),
            })?;

        match tokio::time::timeout(
            self.timeout,
            function.call(content, &call.args, &call.kwargs),
        )
        .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(FunctionError::ExecutionFailed {
                name: call.name.clone(),
                details: format!("{e:#}"),
            }),
            Err(_) => Err(FunctionError::Timeout {
                name: call.name.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[derive(Clone)]
pub struct RemoteProvider {
    client: Arc<dyn RemoteFunctionClient>,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl RemoteProvider {
    pub fn new(client: Arc<dyn RemoteFunctionClient>, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Abort in-flight calls once `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn resolve(
        &self,
        call: &FunctionCall,
        content: &ContentEvent,
    ) -> Result<Value, FunctionError> {
        let timed_out = || FunctionError::Timeout {
            name: call.name.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
        };

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => {
                debug!(function = %call.name, "Remote function call aborted by shutdown");
                Err(timed_out())
            }
            result = tokio::time::timeout(
                self.timeout,
                self.client.invoke(call, content, self.timeout),
            ) => {
                result.unwrap_or_else(|_| Err(timed_out()))
            }
        }
    }
}

impl std::fmt::Debug for RemoteProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProvider")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub enum FunctionProvider {
    Local(LocalProvider),
    Remote(RemoteProvider),
    Hybrid {
        local: LocalProvider,
        remote: RemoteProvider,
    },
}

impl FunctionProvider {
    pub async fn resolve(
        &self,
        call: &FunctionCall,
        content: &ContentEvent,
    ) -> Result<Value, FunctionError> {
        match self {
            FunctionProvider::Local(local) => local.resolve(call, content).await,
            FunctionProvider::Remote(remote) => remote.resolve(call, content).await,
            FunctionProvider::Hybrid { local, remote } => {
                match local.resolve(call, content).await {
                    Err(FunctionError::NotFound { .. }) => {
                        debug!(function = %call.name, "Function not registered locally, calling remote");
                        remote.resolve(call, content).await
                    }
                    result => result,
                }
            }
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            FunctionProvider::Local(_) => "local",
            FunctionProvider::Remote(_) => "remote",
            FunctionProvider::Hybrid { .. } => "hybrid",
        }
    }
}
