//! Named predicate functions referenced by rule conditions.
//!
//! Functions are collected in an explicit [`FunctionRegistry`] built at
//! startup and handed to a [`LocalProvider`]. Where a function lives
//! (in-process, on a remote evaluation service, or both) is decided by the
//! [`FunctionProvider`] variant the service is configured with.
//!
//! ```rust
//! use tieba_reviewer::functions::{FunctionRegistry, builtin};
//! use serde_json::json;
//!
//! let registry = builtin::register_builtins(FunctionRegistry::new())
//!     .register_fn("always_true", |_content, _args, _kwargs| Ok(json!(true)));
//!
//! assert!(registry.contains("has_url"));
//! assert!(registry.contains("always_true"));
//! ```

pub mod builtin;
pub mod provider;
pub mod remote;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::content::ContentEvent;

pub use provider::{FunctionProvider, LocalProvider, RemoteProvider};
pub use remote::{HttpRemoteFunctionClient, RemoteFunctionClient};

/// A function reference embedded in a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: vec![],
            kwargs: Map::new(),
        }
    }

    pub fn with_arg(mut self, arg: Value) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Canonical text form, e.g. `keyword_count(["spam"], limit=3)`.
    ///
    /// Two calls with the same signature are the same call.
    pub fn signature(&self) -> String {
        let parts: Vec<String> = self
            .args
            .iter()
            .map(Value::to_string)
            .chain(self.kwargs.iter().map(|(k, v)| format!("{k}={v}")))
            .collect();
        format!("{}({})", self.name, parts.join(", "))
    }
}

/// An in-process predicate function.
///
/// Errors are reported by the provider as `FunctionError::ExecutionFailed`.
#[async_trait]
pub trait RuleFunction: Send + Sync {
    async fn call(
        &self,
        content: &ContentEvent,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value>;
}

struct SyncFunction<F>(F);

#[async_trait]
impl<F> RuleFunction for SyncFunction<F>
where
    F: Fn(&ContentEvent, &[Value], &Map<String, Value>) -> Result<Value> + Send + Sync,
{
    async fn call(
        &self,
        content: &ContentEvent,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value> {
        (self.0)(content, args, kwargs)
    }
}

/// Explicit name to function table.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn RuleFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function, replacing any previous one with the same name.
    pub fn register(mut self, name: impl Into<String>, function: Arc<dyn RuleFunction>) -> Self {
        self.functions.insert(name.into(), function);
        self
    }

    /// Register a plain synchronous function.
    pub fn register_fn<F>(self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&ContentEvent, &[Value], &Map<String, Value>) -> Result<Value>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, Arc::new(SyncFunction(function)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RuleFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
