//! Metrics publishing.
//!
//! Metric names emitted by the service:
//!
//! | Name | Kind |
//! |---|---|
//! | `reviewer.entries.processed` / `acked` / `retry` / `dead_lettered` / `malformed` | counter |
//! | `reviewer.rules.matched` | counter |
//! | `reviewer.dispatch.published` / `retry` | counter |
//! | `reviewer.function.error` (tag `kind`) | counter |
//! | `reviewer.workers.active` | gauge |
//! | `reviewer.batch.duration` | timing |

use async_trait::async_trait;
use cadence::{
    BufferedUdpMetricSink, Counted, CountedExt, Gauged, Metric, QueuingMetricSink, StatsdClient,
    Timed,
};
use std::net::UdpSocket;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::MetricsConfig;

/// Counter, gauge and timing sink in the shape of cadence's API.
#[async_trait]
pub trait MetricsPublisher: Send + Sync {
    /// Increment a counter by 1
    async fn incr(&self, key: &str);

    /// Increment a counter by a specific value
    async fn count(&self, key: &str, value: u64);

    /// Increment a counter with tags
    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]);

    /// Increment a counter by a specific value with tags
    async fn count_with_tags(&self, key: &str, value: u64, tags: &[(&str, &str)]);

    /// Record a gauge value
    async fn gauge(&self, key: &str, value: u64);

    /// Record a gauge value with tags
    async fn gauge_with_tags(&self, key: &str, value: u64, tags: &[(&str, &str)]);

    /// Record a timing in milliseconds
    async fn time(&self, key: &str, millis: u64);

    /// Record a timing with tags
    async fn time_with_tags(&self, key: &str, millis: u64, tags: &[(&str, &str)]);

    /// Record a histogram value
    async fn histogram(&self, key: &str, value: u64);

    /// Record a histogram value with tags
    async fn histogram_with_tags(&self, key: &str, value: u64, tags: &[(&str, &str)]);
}

/// No-op implementation for development and testing
#[derive(Debug, Clone, Default)]
pub struct NoOpMetricsPublisher;

impl NoOpMetricsPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricsPublisher for NoOpMetricsPublisher {
    async fn incr(&self, _key: &str) {}
    async fn count(&self, _key: &str, _value: u64) {}
    async fn incr_with_tags(&self, _key: &str, _tags: &[(&str, &str)]) {}
    async fn count_with_tags(&self, _key: &str, _value: u64, _tags: &[(&str, &str)]) {}
    async fn gauge(&self, _key: &str, _value: u64) {}
    async fn gauge_with_tags(&self, _key: &str, _value: u64, _tags: &[(&str, &str)]) {}
    async fn time(&self, _key: &str, _millis: u64) {}
    async fn time_with_tags(&self, _key: &str, _millis: u64, _tags: &[(&str, &str)]) {}
    async fn histogram(&self, _key: &str, _value: u64) {}
    async fn histogram_with_tags(&self, _key: &str, _value: u64, _tags: &[(&str, &str)]) {}
}

/// Statsd-backed metrics publisher using cadence
pub struct StatsdMetricsPublisher {
    client: StatsdClient,
    default_tags: Vec<(String, String)>,
}

impl StatsdMetricsPublisher {
    /// Bind a non-blocking UDP socket on `bind_addr` and send to `host`.
    pub fn new_with_bind_and_tags(
        host: &str,
        prefix: &str,
        bind_addr: &str,
        default_tags: Vec<(String, String)>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;

        let buffered_sink = BufferedUdpMetricSink::from(host, socket)?;
        let queuing_sink = QueuingMetricSink::builder()
            .with_error_handler(move |error| {
                error!(error = ?error, "Failed to send metric via sink");
            })
            .build(buffered_sink);
        let client = StatsdClient::from_sink(prefix, queuing_sink);

        tracing::info!(host, prefix, bind = bind_addr, tags = ?default_tags, "StatsD metrics enabled");
        Ok(Self {
            client,
            default_tags,
        })
    }

    /// Apply default tags to a builder
    fn apply_default_tags<'a, M>(
        &'a self,
        mut builder: cadence::MetricBuilder<'a, 'a, M>,
    ) -> cadence::MetricBuilder<'a, 'a, M>
    where
        M: Metric + From<String>,
    {
        for (k, v) in &self.default_tags {
            builder = builder.with_tag(k.as_str(), v.as_str());
        }
        builder
    }
}

#[async_trait]
impl MetricsPublisher for StatsdMetricsPublisher {
    async fn incr(&self, key: &str) {
        if self.default_tags.is_empty() {
            if let Err(e) = self.client.incr(key) {
                debug!(metric = key, error = ?e, "Failed to send metric");
            }
        } else {
            let builder = self.client.incr_with_tags(key);
            self.apply_default_tags(builder).send();
        }
    }

    async fn count(&self, key: &str, value: u64) {
        if self.default_tags.is_empty() {
            let _ = self.client.count(key, value);
        } else {
            let builder = self.client.count_with_tags(key, value);
            let builder = self.apply_default_tags(builder);
            let _ = builder.send();
        }
    }

    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]) {
        let mut builder = self.client.incr_with_tags(key);
        builder = self.apply_default_tags(builder);
        for (k, v) in tags {
            builder = builder.with_tag(k, v);
        }
        let _ = builder.send();
    }

    async fn count_with_tags(&self, key: &str, value: u64, tags: &[(&str, &str)]) {
        let mut builder = self.client.count_with_tags(key, value);
        builder = self.apply_default_tags(builder);
        for (k, v) in tags {
            builder = builder.with_tag(k, v);
        }
        let _ = builder.send();
    }

    async fn gauge(&self, key: &str, value: u64) {
        if self.default_tags.is_empty() {
            if let Err(e) = self.client.gauge(key, value) {
                debug!(metric = key, value, error = ?e, "Failed to send gauge");
            }
        } else {
            let builder = self.client.gauge_with_tags(key, value);
            self.apply_default_tags(builder).send();
        }
    }

    async fn gauge_with_tags(&self, key: &str, value: u64, tags: &[(&str, &str)]) {
        let mut builder = self.client.gauge_with_tags(key, value);
        builder = self.apply_default_tags(builder);
        for (k, v) in tags {
            builder = builder.with_tag(k, v);
        }
        let _ = builder.send();
    }

    async fn time(&self, key: &str, millis: u64) {
        if self.default_tags.is_empty() {
            let _ = self.client.time(key, millis);
        } else {
            let builder = self.client.time_with_tags(key, millis);
            let builder = self.apply_default_tags(builder);
            let _ = builder.send();
        }
    }

    async fn time_with_tags(&self, key: &str, millis: u64, tags: &[(&str, &str)]) {
        let mut builder = self.client.time_with_tags(key, millis);
        builder = self.apply_default_tags(builder);
        for (k, v) in tags {
            builder = builder.with_tag(k, v);
        }
        let _ = builder.send();
    }

    async fn histogram(&self, key: &str, value: u64) {
        // StatsD doesn't have native histogram support, use timing as fallback
        self.time(key, value).await;
    }

    async fn histogram_with_tags(&self, key: &str, value: u64, tags: &[(&str, &str)]) {
        // StatsD doesn't have native histogram support, use timing as fallback
        self.time_with_tags(key, value, tags).await;
    }
}

/// Type alias for shared metrics publisher
pub type SharedMetricsPublisher = Arc<dyn MetricsPublisher>;

/// Metrics-specific errors
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to create metrics publisher
    #[error("error-reviewer-metrics-1 Failed to create metrics publisher: {0}")]
    CreationFailed(String),

    /// Invalid configuration for metrics
    #[error("error-reviewer-metrics-2 Invalid metrics configuration: {0}")]
    InvalidConfig(String),
}

/// Create the publisher selected by `METRICS_ADAPTER`.
pub fn create_metrics_publisher(
    config: &MetricsConfig,
) -> Result<SharedMetricsPublisher, MetricsError> {
    match config.adapter.as_str() {
        "noop" | "" => Ok(Arc::new(NoOpMetricsPublisher::new())),
        "statsd" => {
            let host = config.statsd_host.as_deref().ok_or_else(|| {
                MetricsError::InvalidConfig(
                    "METRICS_STATSD_HOST is required when using statsd adapter".to_string(),
                )
            })?;

            let publisher = StatsdMetricsPublisher::new_with_bind_and_tags(
                host,
                &config.prefix,
                &config.statsd_bind,
                config.tags.clone(),
            )
            .map_err(|e| MetricsError::CreationFailed(e.to_string()))?;

            Ok(Arc::new(publisher))
        }
        other => Err(MetricsError::InvalidConfig(format!(
            "Unknown metrics adapter: {other}"
        ))),
    }
}

/// Parse comma-separated `key:value` pairs, skipping malformed ones.
pub fn parse_tags(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .filter_map(|tag| match tag.split_once(':') {
            Some((key, value)) if !key.is_empty() && !value.contains(':') => {
                Some((key.to_string(), value.to_string()))
            }
            _ => {
                error!(tag = %tag, "Invalid metrics tag, expected key:value");
                None
            }
        })
        .collect()
}

/// Helper struct for timing operations
pub struct MetricTimer {
    start: std::time::Instant,
    metric: String,
    publisher: SharedMetricsPublisher,
    tags: Vec<(String, String)>,
}

impl MetricTimer {
    /// Start a new timer
    pub fn new(metric: impl Into<String>, publisher: SharedMetricsPublisher) -> Self {
        Self {
            start: std::time::Instant::now(),
            metric: metric.into(),
            publisher,
            tags: vec![],
        }
    }

    /// Add a tag to the timer
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Record the elapsed time
    pub async fn record(self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        if self.tags.is_empty() {
            self.publisher.time(&self.metric, elapsed).await;
        } else {
            let tags: Vec<(&str, &str)> = self
                .tags
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            self.publisher
                .time_with_tags(&self.metric, elapsed, &tags)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_metrics() {
        let metrics = NoOpMetricsPublisher::new();

        // These should all be no-ops and not panic
        metrics.incr("reviewer.entries.acked").await;
        metrics.count("reviewer.dispatch.published", 5).await;
        metrics
            .incr_with_tags("reviewer.function.error", &[("kind", "timeout")])
            .await;
        metrics.gauge("reviewer.workers.active", 3).await;
        metrics.time("reviewer.batch.duration", 42).await;
        metrics.histogram("reviewer.batch.size", 10).await;
    }

    #[tokio::test]
    async fn test_metric_timer() {
        let metrics: SharedMetricsPublisher = Arc::new(NoOpMetricsPublisher::new());
        let timer = MetricTimer::new("reviewer.batch.duration", metrics.clone())
            .with_tag("partition", "12");

        // Simulate some work
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        timer.record().await;
    }

    fn metrics_config(adapter: &str) -> MetricsConfig {
        MetricsConfig {
            adapter: adapter.to_string(),
            ..MetricsConfig::default()
        }
    }

    #[test]
    fn test_create_noop_publisher() {
        assert!(create_metrics_publisher(&metrics_config("noop")).is_ok());
    }

    #[test]
    fn test_missing_statsd_host() {
        let result = create_metrics_publisher(&metrics_config("statsd"));
        assert!(matches!(result, Err(MetricsError::InvalidConfig(_))));
    }

    #[test]
    fn test_unknown_adapter() {
        let result = create_metrics_publisher(&metrics_config("prometheus"));
        assert!(matches!(result, Err(MetricsError::InvalidConfig(_))));
    }

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags("env:prod, region:cn-north ,broken,a:b:c,");
        assert_eq!(
            tags,
            vec![
                ("env".to_string(), "prod".to_string()),
                ("region".to_string(), "cn-north".to_string()),
            ]
        );
    }
}
