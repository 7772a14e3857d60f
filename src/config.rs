//! Environment-driven configuration.
//!
//! Numeric values that fail to parse fall back to their default and values
//! below a minimum are clamped. Structural problems, such as an unknown
//! function provider or a remote provider without an endpoint, are errors.

use std::time::Duration;

use crate::dispatcher::RetryPolicy;
use crate::errors::ConfigError;
use crate::metrics::parse_tags;
use crate::rules::DEFAULT_MAX_RULE_DEPTH;

type Result<T> = std::result::Result<T, ConfigError>;

/// How function-backed conditions are executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionProviderKind {
    Local,
    Remote,
    Hybrid,
}

impl FunctionProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionProviderKind::Local => "local",
            FunctionProviderKind::Remote => "remote",
            FunctionProviderKind::Hybrid => "hybrid",
        }
    }

    pub fn needs_remote(&self) -> bool {
        !matches!(self, FunctionProviderKind::Local)
    }
}

impl TryFrom<String> for FunctionProviderKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "local" => Ok(Self::Local),
            "remote" | "rpc" => Ok(Self::Remote),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(ConfigError::InvalidFunctionProvider { value }),
        }
    }
}

/// Input and output stream names.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Prefix of the per-partition input streams, `{prefix}:{fid}`.
    pub stream_key: String,
    pub consumer_group: String,
    /// Must be stable across restarts so a restarted worker finds its own
    /// pending entries.
    pub consumer_name: String,
    pub action_stream_key: String,
    pub dead_letter_stream_key: String,
    pub rules_channel: String,
    pub batch_size: usize,
    pub read_block: Duration,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Processing attempts per entry before it is dead-lettered.
    pub max_dispatch_attempts: u32,
    pub retry: RetryPolicy,
}

#[derive(Clone, Debug)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub min_idle: Duration,
}

#[derive(Clone, Debug)]
pub struct FunctionConfig {
    pub provider: FunctionProviderKind,
    pub rpc_url: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub adapter: String,
    pub statsd_host: Option<String>,
    pub statsd_bind: String,
    pub prefix: String,
    pub tags: Vec<(String, String)>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            adapter: "noop".to_string(),
            statsd_host: None,
            statsd_bind: "[::]:0".to_string(),
            prefix: "tieba_reviewer".to_string(),
            tags: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub version: String,
    pub database_url: String,
    pub redis_url: String,
    pub stream: StreamConfig,
    pub dispatch: DispatchConfig,
    pub recovery: RecoveryConfig,
    pub rule_sync_interval: Duration,
    pub worker_drain_timeout: Duration,
    pub functions: FunctionConfig,
    pub max_rule_depth: usize,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Requires `DATABASE_URL` and `REDIS_URL`; everything else has a default.
    pub fn new() -> Result<Self> {
        Self::from_source(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_source<F>(source: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(source);

        let database_url = env.require("DATABASE_URL")?;
        let redis_url = env.require("REDIS_URL")?;

        let consumer_name = match env.get("REDIS_CONSUMER_NAME") {
            Some(name) if !name.trim().is_empty() => name,
            Some(_) => format!("reviewer-{}", uuid::Uuid::new_v4()),
            None => "reviewer_worker_1".to_string(),
        };

        let stream = StreamConfig {
            stream_key: env.or("REDIS_STREAM_KEY", "scraper:tieba:events"),
            consumer_group: env.or("REDIS_CONSUMER_GROUP", "reviewer_group"),
            consumer_name,
            action_stream_key: env.or("REDIS_ACTION_STREAM_KEY", "reviewer:actions:stream"),
            dead_letter_stream_key: env.or(
                "REDIS_DEAD_LETTER_STREAM_KEY",
                "reviewer:deadletter:stream",
            ),
            rules_channel: env.or("REDIS_RULES_CHANNEL", "reviewer:rules:update"),
            batch_size: env.number("BATCH_SIZE", 10usize).max(1),
            read_block: Duration::from_millis(env.number("READ_BLOCK_MS", 2000u64)),
        };

        let dispatch = DispatchConfig {
            max_dispatch_attempts: env.number("MAX_DISPATCH_ATTEMPTS", 5u32).max(1),
            retry: RetryPolicy {
                max_attempts: env.number("DISPATCH_RETRY_ATTEMPTS", 3u32).max(1),
                initial_delay: Duration::from_millis(env.number("DISPATCH_RETRY_DELAY_MS", 200u64)),
                max_delay: Duration::from_millis(
                    env.number("DISPATCH_RETRY_MAX_DELAY_MS", 5000u64),
                ),
            },
        };

        let recovery = RecoveryConfig {
            enabled: env.flag("ENABLE_STREAM_RECOVERY", true),
            interval: Duration::from_secs(env.number("STREAM_RECOVERY_INTERVAL_SECS", 60u64).max(1)),
            min_idle: Duration::from_millis(env.number("STREAM_MIN_IDLE_MS", 60_000u64)),
        };

        let mut provider: FunctionProviderKind = env.or("FUNCTION_PROVIDER", "local").try_into()?;
        if provider == FunctionProviderKind::Local && env.flag("RPC_ENABLED", false) {
            provider = FunctionProviderKind::Hybrid;
        }
        let rpc_url = env.get("RPC_URL").filter(|url| !url.trim().is_empty());
        if provider.needs_remote() && rpc_url.is_none() {
            return Err(ConfigError::RemoteEndpointRequired {
                provider: provider.as_str().to_string(),
            });
        }

        let functions = FunctionConfig {
            provider,
            rpc_url,
            timeout: Duration::from_millis(env.number("FUNCTION_TIMEOUT_MS", 3000u64).max(1)),
        };

        let metrics = MetricsConfig {
            adapter: env.or("METRICS_ADAPTER", "noop").to_lowercase(),
            statsd_host: env.get("METRICS_STATSD_HOST").filter(|h| !h.is_empty()),
            statsd_bind: env.or("METRICS_STATSD_BIND", "[::]:0"),
            prefix: env.or("METRICS_PREFIX", "tieba_reviewer"),
            tags: env
                .get("METRICS_TAGS")
                .map(|tags| parse_tags(&tags))
                .unwrap_or_default(),
        };

        Ok(Self {
            version: version()?,
            database_url,
            redis_url,
            stream,
            dispatch,
            recovery,
            rule_sync_interval: Duration::from_secs(
                env.number("RULE_SYNC_INTERVAL_SECS", 300u64).max(1),
            ),
            worker_drain_timeout: Duration::from_secs(env.number("WORKER_DRAIN_TIMEOUT_SECS", 30u64)),
            functions,
            max_rule_depth: env
                .number("MAX_RULE_DEPTH", DEFAULT_MAX_RULE_DEPTH)
                .max(1),
            metrics,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name)
    }

    fn require(&self, name: &str) -> Result<String> {
        self.get(name)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ConfigError::EnvVarRequired {
                var_name: name.to_string(),
            })
    }

    fn or(&self, name: &str, default_value: &str) -> String {
        self.get(name)
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| default_value.to_string())
    }

    fn number<T: std::str::FromStr>(&self, name: &str, default_value: T) -> T {
        match self.get(name) {
            Some(value) => value.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(var = name, value = %value, "Invalid number, using default");
                default_value
            }),
            None => default_value,
        }
    }

    fn flag(&self, name: &str, default_value: bool) -> bool {
        match self.get(name).map(|value| value.trim().to_lowercase()) {
            Some(value) if matches!(value.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(value) if matches!(value.as_str(), "0" | "false" | "no" | "off") => false,
            _ => default_value,
        }
    }
}

/// The service version from compile-time environment variables.
pub fn version() -> Result<String> {
    option_env!("GIT_HASH")
        .or(option_env!("CARGO_PKG_VERSION"))
        .map(|val| val.to_string())
        .ok_or(ConfigError::VersionNotAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let mut env: HashMap<String, String> = HashMap::from([
            ("DATABASE_URL".to_string(), "postgres://localhost/reviewer".to_string()),
            ("REDIS_URL".to_string(), "redis://localhost".to_string()),
        ]);
        for (name, value) in vars {
            env.insert(name.to_string(), value.to_string());
        }
        Config::from_source(|name| env.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).expect("Failed to load config");
        assert_eq!(config.stream.stream_key, "scraper:tieba:events");
        assert_eq!(config.stream.consumer_group, "reviewer_group");
        assert_eq!(config.stream.consumer_name, "reviewer_worker_1");
        assert_eq!(config.stream.batch_size, 10);
        assert_eq!(config.dispatch.max_dispatch_attempts, 5);
        assert_eq!(config.dispatch.retry, RetryPolicy::default());
        assert!(config.recovery.enabled);
        assert_eq!(config.recovery.min_idle, Duration::from_secs(60));
        assert_eq!(config.functions.provider, FunctionProviderKind::Local);
        assert_eq!(config.functions.timeout, Duration::from_secs(3));
        assert_eq!(config.max_rule_depth, DEFAULT_MAX_RULE_DEPTH);
        assert_eq!(config.metrics.adapter, "noop");
    }

    #[test]
    fn test_required_variables() {
        let result = Config::from_source(|_| None);
        assert!(matches!(
            result,
            Err(ConfigError::EnvVarRequired { ref var_name }) if var_name == "DATABASE_URL"
        ));
    }

    #[test]
    fn test_invalid_numbers_fall_back_and_clamp() {
        let config = load(&[
            ("BATCH_SIZE", "0"),
            ("READ_BLOCK_MS", "soon"),
            ("MAX_DISPATCH_ATTEMPTS", "-3"),
        ])
        .expect("Failed to load config");
        assert_eq!(config.stream.batch_size, 1);
        assert_eq!(config.stream.read_block, Duration::from_millis(2000));
        assert_eq!(config.dispatch.max_dispatch_attempts, 5);
    }

    #[test]
    fn test_rpc_enabled_upgrades_local_to_hybrid() {
        let config = load(&[("RPC_ENABLED", "true"), ("RPC_URL", "http://rpc:8000/call")])
            .expect("Failed to load config");
        assert_eq!(config.functions.provider, FunctionProviderKind::Hybrid);
        assert_eq!(config.functions.rpc_url.as_deref(), Some("http://rpc:8000/call"));
    }

    #[test]
    fn test_remote_provider_requires_endpoint() {
        assert!(matches!(
            load(&[("FUNCTION_PROVIDER", "remote")]),
            Err(ConfigError::RemoteEndpointRequired { .. })
        ));
        assert!(matches!(
            load(&[("FUNCTION_PROVIDER", "grpc-ish")]),
            Err(ConfigError::InvalidFunctionProvider { .. })
        ));
    }

    #[test]
    fn test_blank_consumer_name_is_generated() {
        let config = load(&[("REDIS_CONSUMER_NAME", " ")]).expect("Failed to load config");
        assert!(config.stream.consumer_name.starts_with("reviewer-"));
    }

    #[test]
    fn test_metrics_tags() {
        let config = load(&[("METRICS_ADAPTER", "StatsD"), ("METRICS_TAGS", "env:prod")])
            .expect("Failed to load config");
        assert_eq!(config.metrics.adapter, "statsd");
        assert_eq!(
            config.metrics.tags,
            vec![("env".to_string(), "prod".to_string())]
        );
    }
}
