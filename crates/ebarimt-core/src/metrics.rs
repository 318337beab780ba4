//! Operational metrics kept in the shared cache.
//!
//! Metric writes are best-effort: a failing cache never fails the operation
//! being measured.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cache::Cache;
use crate::timestamp::UtcDateTime;

const KEY_PREFIX: &str = "metrics:ebarimt";
const METRIC_TTL: Duration = Duration::from_secs(86_400);
const MAX_TIMINGS: usize = 100;

pub type Tags<'a> = &'a [(&'a str, &'a str)];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeValue {
    pub value: f64,
    pub timestamp: UtcDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TimingSample {
    value: f64,
    timestamp: UtcDateTime,
}

/// Summary of the last recorded timings, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimingStats {
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p50: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99: Option<f64>,
}

impl TimingStats {
    fn from_values(mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(f64::total_cmp);
        let count = values.len();
        let sum: f64 = values.iter().sum();
        Self {
            count,
            min: values.first().copied(),
            max: values.last().copied(),
            avg: Some(sum / count as f64),
            p50: Some(percentile(&values, 50)),
            p95: Some(percentile(&values, 95)),
            p99: Some(percentile(&values, 99)),
        }
    }
}

/// `values` must be sorted and non-empty.
fn percentile(values: &[f64], percentile: usize) -> f64 {
    let index = (values.len() * percentile / 100).min(values.len() - 1);
    values[index]
}

/// Counters, gauges and timing series under `metrics:ebarimt:*`.
#[derive(Clone)]
pub struct MetricsCollector {
    cache: Arc<dyn Cache>,
}

impl MetricsCollector {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    /// `metrics:ebarimt:{name}` followed by `:k=v` pairs sorted by key.
    pub fn key(name: &str, tags: Tags<'_>) -> String {
        let mut key = format!("{KEY_PREFIX}:{name}");
        if !tags.is_empty() {
            let mut sorted = tags.to_vec();
            sorted.sort_unstable();
            let joined = sorted
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join(":");
            key.push(':');
            key.push_str(&joined);
        }
        key
    }

    pub async fn increment(&self, name: &str, value: f64, tags: Tags<'_>) {
        let key = Self::key(name, tags);
        let current = self.read_counter(&key).await;
        self.write(&key, json!(current + value)).await;
    }

    pub async fn gauge(&self, name: &str, value: f64, tags: Tags<'_>) {
        let key = Self::key(name, tags);
        let gauge = GaugeValue {
            value,
            timestamp: UtcDateTime::now(),
        };
        match serde_json::to_value(gauge) {
            Ok(encoded) => self.write(&key, encoded).await,
            Err(error) => tracing::debug!(%key, %error, "failed to encode gauge"),
        }
    }

    /// Append a sample; only the newest 100 are kept.
    pub async fn timing(&self, name: &str, duration_ms: f64, tags: Tags<'_>) {
        let key = Self::key(&format!("{name}:timings"), tags);
        let mut samples = self.read_timings(&key).await;
        samples.push(TimingSample {
            value: duration_ms,
            timestamp: UtcDateTime::now(),
        });
        if samples.len() > MAX_TIMINGS {
            samples.drain(..samples.len() - MAX_TIMINGS);
        }
        match serde_json::to_value(samples) {
            Ok(encoded) => self.write(&key, encoded).await,
            Err(error) => tracing::debug!(%key, %error, "failed to encode timings"),
        }
    }

    pub async fn counter(&self, name: &str, tags: Tags<'_>) -> f64 {
        self.read_counter(&Self::key(name, tags)).await
    }

    pub async fn gauge_value(&self, name: &str, tags: Tags<'_>) -> Option<GaugeValue> {
        let value = self.read(&Self::key(name, tags)).await?;
        serde_json::from_value(value).ok()
    }

    pub async fn timing_stats(&self, name: &str, tags: Tags<'_>) -> TimingStats {
        let key = Self::key(&format!("{name}:timings"), tags);
        let values = self
            .read_timings(&key)
            .await
            .into_iter()
            .map(|sample| sample.value)
            .collect();
        TimingStats::from_values(values)
    }

    pub async fn record_receipt(&self, bill_type: &str, success: bool, duration_ms: f64) {
        let tags: Tags<'_> = &[("type", bill_type)];
        let outcome = if success {
            "receipts_success"
        } else {
            "receipts_failed"
        };
        for series in [[].as_slice(), tags] {
            self.increment("receipts_total", 1.0, series).await;
            self.increment(outcome, 1.0, series).await;
        }
        self.timing("receipt_latency", duration_ms, &[]).await;
        self.timing("receipt_latency", duration_ms, tags).await;
    }

    pub async fn record_return(&self, success: bool) {
        self.increment("returns_total", 1.0, &[]).await;
        let outcome = if success {
            "returns_success"
        } else {
            "returns_failed"
        };
        self.increment(outcome, 1.0, &[]).await;
    }

    pub async fn record_queue_size(&self, size: u64) {
        self.gauge("offline_queue_size", size as f64, &[]).await;
    }

    pub async fn record_lottery_check(&self, success: bool) {
        self.increment("lottery_checks_total", 1.0, &[]).await;
        if success {
            self.increment("lottery_checks_success", 1.0, &[]).await;
        }
    }

    pub async fn record_api_call(&self, endpoint: &str, success: bool, duration_ms: f64) {
        let tags: Tags<'_> = &[("endpoint", endpoint)];
        let outcome = if success {
            "api_calls_success"
        } else {
            "api_calls_failed"
        };
        self.increment("api_calls_total", 1.0, tags).await;
        self.increment(outcome, 1.0, tags).await;
        self.timing("api_latency", duration_ms, &[]).await;
        self.timing("api_latency", duration_ms, tags).await;
    }

    pub async fn record_error(&self, error_type: &str, endpoint: Option<&str>) {
        self.increment("errors_total", 1.0, &[]).await;
        match endpoint {
            Some(endpoint) => {
                self.increment(
                    "errors_total",
                    1.0,
                    &[("type", error_type), ("endpoint", endpoint)],
                )
                .await;
            }
            None => self.increment("errors_total", 1.0, &[("type", error_type)]).await,
        }
    }

    /// Snapshot for operators.
    pub async fn summary(&self) -> Value {
        json!({
            "timestamp": UtcDateTime::now(),
            "receipts": {
                "total": self.counter("receipts_total", &[]).await,
                "success": self.counter("receipts_success", &[]).await,
                "failed": self.counter("receipts_failed", &[]).await,
                "b2c": self.counter("receipts_total", &[("type", "B2C_RECEIPT")]).await,
                "b2b": self.counter("receipts_total", &[("type", "B2B_RECEIPT")]).await,
            },
            "returns": {
                "total": self.counter("returns_total", &[]).await,
                "success": self.counter("returns_success", &[]).await,
            },
            "offline_queue": self.gauge_value("offline_queue_size", &[]).await,
            "latency": self.timing_stats("receipt_latency", &[]).await,
            "api_latency": self.timing_stats("api_latency", &[]).await,
            "errors": self.counter("errors_total", &[]).await,
        })
    }

    async fn read(&self, key: &str) -> Option<Value> {
        match self.cache.get(key).await {
            Ok(value) => value,
            Err(error) => {
                tracing::debug!(key, %error, "metrics read failed");
                None
            }
        }
    }

    async fn read_counter(&self, key: &str) -> f64 {
        self.read(key).await.and_then(|value| value.as_f64()).unwrap_or(0.0)
    }

    async fn read_timings(&self, key: &str) -> Vec<TimingSample> {
        self.read(key)
            .await
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    async fn write(&self, key: &str, value: Value) {
        if let Err(error) = self.cache.set(key, value, Some(METRIC_TTL)).await {
            tracing::debug!(key, %error, "metrics write failed");
        }
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("cache", &self.cache.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheFuture, MemoryCache};
    use crate::error::CacheError;

    struct BrokenCache;

    impl Cache for BrokenCache {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn get<'a>(&'a self, _key: &'a str) -> CacheFuture<'a, Option<Value>> {
            Box::pin(async { Err(CacheError::Unavailable("down".to_string())) })
        }

        fn set<'a>(&'a self, _key: &'a str, _value: Value, _ttl: Option<Duration>) -> CacheFuture<'a, ()> {
            Box::pin(async { Err(CacheError::Unavailable("down".to_string())) })
        }

        fn delete<'a>(&'a self, _key: &'a str) -> CacheFuture<'a, ()> {
            Box::pin(async { Err(CacheError::Unavailable("down".to_string())) })
        }
    }

    fn collector() -> MetricsCollector {
        MetricsCollector::new(Arc::new(MemoryCache::new()))
    }

    #[test]
    fn tags_are_sorted_into_the_key() {
        assert_eq!(MetricsCollector::key("api_calls_total", &[]), "metrics:ebarimt:api_calls_total");
        assert_eq!(
            MetricsCollector::key("errors_total", &[("type", "timeout"), ("endpoint", "receipt")]),
            "metrics:ebarimt:errors_total:endpoint=receipt:type=timeout"
        );
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let metrics = collector();
        metrics.increment("hits", 1.0, &[]).await;
        metrics.increment("hits", 2.0, &[]).await;
        assert_eq!(metrics.counter("hits", &[]).await, 3.0);
        assert_eq!(metrics.counter("misses", &[]).await, 0.0);
    }

    #[tokio::test]
    async fn timing_series_is_bounded_and_summarized() {
        let metrics = collector();
        for value in 1..=150 {
            metrics.timing("latency", f64::from(value), &[]).await;
        }

        let stats = metrics.timing_stats("latency", &[]).await;
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, Some(51.0));
        assert_eq!(stats.max, Some(150.0));
        assert_eq!(stats.p50, Some(101.0));
        assert_eq!(stats.p99, Some(150.0));
        assert_eq!(stats.avg, Some(100.5));
    }

    #[tokio::test]
    async fn receipt_helpers_feed_the_summary() {
        let metrics = collector();
        metrics.record_receipt("B2C_RECEIPT", true, 120.0).await;
        metrics.record_receipt("B2B_RECEIPT", false, 80.0).await;
        metrics.record_queue_size(4).await;
        metrics.record_error("timeout", Some("receipt")).await;

        let summary = metrics.summary().await;
        assert_eq!(summary["receipts"]["total"], 2.0);
        assert_eq!(summary["receipts"]["success"], 1.0);
        assert_eq!(summary["receipts"]["failed"], 1.0);
        assert_eq!(summary["receipts"]["b2c"], 1.0);
        assert_eq!(summary["receipts"]["b2b"], 1.0);
        assert_eq!(summary["offline_queue"]["value"], 4.0);
        assert_eq!(summary["latency"]["count"], 2);
        assert_eq!(summary["errors"], 1.0);
    }

    #[tokio::test]
    async fn failing_cache_is_swallowed() {
        let metrics = MetricsCollector::new(Arc::new(BrokenCache));
        metrics.record_api_call("receipt", true, 10.0).await;
        assert_eq!(metrics.counter("api_calls_total", &[("endpoint", "receipt")]).await, 0.0);
        assert_eq!(metrics.timing_stats("api_latency", &[]).await, TimingStats::default());
    }
}
