//! Liveness, readiness and detailed health checks.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::client::ResilientClient;
use crate::circuit_breaker::CircuitState;
use crate::endpoints::Service;
use crate::timestamp::UtcDateTime;

const HEALTH_KEY: &str = "ebarimt:health_check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Healthy,
    Degraded,
    Warning,
    Unhealthy,
    Disabled,
    NotConfigured,
}

impl CheckStatus {
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Healthy | Self::Disabled | Self::NotConfigured)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Warning => "warning",
            Self::Unhealthy => "unhealthy",
            Self::Disabled => "disabled",
            Self::NotConfigured => "not_configured",
        }
    }
}

/// Result of one dependency check. `details` are flattened into the output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Check {
    pub status: CheckStatus,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl Check {
    fn new(status: CheckStatus) -> Self {
        Self {
            status,
            details: Map::new(),
        }
    }

    fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_owned(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: CheckStatus,
    pub app: &'static str,
    pub version: &'static str,
    pub timestamp: UtcDateTime,
    pub checks: BTreeMap<&'static str, Check>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn liveness() -> Value {
    json!({ "alive": true, "timestamp": UtcDateTime::now() })
}

pub fn health() -> Value {
    json!({ "status": "healthy", "app": "ebarimt", "timestamp": UtcDateTime::now() })
}

/// Ready when the store answers and an enabled integration has a POS URL.
pub async fn readiness(client: &ResilientClient) -> Readiness {
    if let Some(store) = client.store() {
        if let Err(error) = store.ping() {
            return Readiness {
                ready: false,
                error: Some(error.to_string()),
            };
        }
    }

    let config = client.config();
    if config.enabled && config.api.pos.primary.trim().is_empty() {
        return Readiness {
            ready: false,
            error: Some("Not ready: POS API URL not configured".to_owned()),
        };
    }

    Readiness {
        ready: true,
        error: None,
    }
}

/// Every check plus an overall status: unhealthy when the database or
/// settings check fails, degraded when any other check is not healthy.
pub async fn detailed_health(client: &ResilientClient) -> HealthReport {
    let mut checks = BTreeMap::new();
    checks.insert("database", check_database(client));
    checks.insert("cache", check_cache(client).await);
    checks.insert("settings", check_settings(client));
    checks.insert("pending_queue", check_pending_queue(client).await);
    checks.insert("circuit_breaker", check_circuit_breaker(client).await);

    let critical_ok = ["database", "settings"]
        .iter()
        .all(|name| checks.get(name).is_some_and(|check| check.status.is_ok()));
    let all_ok = checks.values().all(|check| check.status.is_ok());
    let status = if !critical_ok {
        CheckStatus::Unhealthy
    } else if !all_ok {
        CheckStatus::Degraded
    } else {
        CheckStatus::Healthy
    };

    HealthReport {
        status,
        app: "ebarimt",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: UtcDateTime::now(),
        checks,
    }
}

fn check_database(client: &ResilientClient) -> Check {
    let Some(store) = client.store() else {
        return Check::new(CheckStatus::NotConfigured);
    };
    match store.ping() {
        Ok(()) => Check::new(CheckStatus::Healthy)
            .with("path", store.db_path().display().to_string()),
        Err(error) => Check::new(CheckStatus::Unhealthy).with("error", error.to_string()),
    }
}

async fn check_cache(client: &ResilientClient) -> Check {
    let cache = client.cache();
    let roundtrip = async {
        cache
            .set(HEALTH_KEY, json!("ok"), Some(Duration::from_secs(60)))
            .await?;
        cache.get(HEALTH_KEY).await
    };
    match roundtrip.await {
        Ok(Some(value)) if value == json!("ok") => {
            Check::new(CheckStatus::Healthy).with("backend", cache.name())
        }
        Ok(_) => Check::new(CheckStatus::Unhealthy).with("error", "Cache read/write mismatch"),
        Err(error) => Check::new(CheckStatus::Unhealthy).with("error", error.to_string()),
    }
}

fn check_settings(client: &ResilientClient) -> Check {
    if !client.config().enabled {
        return Check::new(CheckStatus::Disabled);
    }
    let report = client.config().validate();
    let errors: Vec<String> = report.errors().map(|issue| issue.message.clone()).collect();
    let warnings: Vec<String> = report.warnings().map(|issue| issue.message.clone()).collect();

    if !errors.is_empty() {
        Check::new(CheckStatus::Unhealthy).with("issues", errors)
    } else if !warnings.is_empty() {
        Check::new(CheckStatus::Healthy).with("warnings", warnings)
    } else {
        Check::new(CheckStatus::Healthy)
    }
}

async fn check_pending_queue(client: &ResilientClient) -> Check {
    let queue = client.queue();
    let stats = match queue.queue_stats().await {
        Ok(stats) => stats,
        Err(error) => return Check::new(CheckStatus::Warning).with("error", error.to_string()),
    };

    let pending_count = stats.pending + stats.failed;
    let high_water_mark = client.config().queue.high_water_mark;
    let check = if pending_count > high_water_mark {
        Check::new(CheckStatus::Warning).with("message", "High number of pending receipts")
    } else {
        Check::new(CheckStatus::Healthy)
    };
    check
        .with("pending_count", pending_count)
        .with("failed", stats.failed)
        .with("source", stats.source)
}

async fn check_circuit_breaker(client: &ResilientClient) -> Check {
    let snapshot = client.breaker(Service::Pos).snapshot().await;
    let status = if snapshot.state == CircuitState::Closed {
        CheckStatus::Healthy
    } else {
        CheckStatus::Degraded
    };
    Check::new(status)
        .with("state", snapshot.state.as_str())
        .with("failure_count", snapshot.failure_count)
}
