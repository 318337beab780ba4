//! Operator actions. Each requires the System Manager or Administrator role.

use ebarimt_store::StoreError;
use serde_json::{json, Value};
use thiserror::Error;

use crate::client::ResilientClient;
use crate::endpoints::Service;
use crate::error::QueueError;
use crate::health;

pub const OPERATOR_ROLES: [&str; 2] = ["System Manager", "Administrator"];

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("not permitted: requires one of the roles {}", OPERATOR_ROLES.join(", "))]
    PermissionDenied,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("the receipt log needs the durable store")]
    StoreUnavailable,

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub fn authorize<S: AsRef<str>>(roles: &[S]) -> Result<(), OperatorError> {
    if roles
        .iter()
        .any(|role| OPERATOR_ROLES.contains(&role.as_ref()))
    {
        Ok(())
    } else {
        Err(OperatorError::PermissionDenied)
    }
}

/// Item counts per status and the backend holding the queue.
pub async fn queue_status<S: AsRef<str>>(
    client: &ResilientClient,
    roles: &[S],
) -> Result<Value, OperatorError> {
    authorize(roles)?;
    let stats = client.queue().queue_stats().await?;
    Ok(serde_json::to_value(stats)?)
}

/// Every Failed item back to Pending with its retry count cleared.
pub async fn retry_failed_items<S: AsRef<str>>(
    client: &ResilientClient,
    roles: &[S],
) -> Result<Value, OperatorError> {
    authorize(roles)?;
    let reset_count = client.queue().retry_failed_items().await?;
    Ok(json!({ "reset_count": reset_count }))
}

/// Force a service's breaker Closed.
pub async fn reset_circuit_breaker<S: AsRef<str>>(
    client: &ResilientClient,
    roles: &[S],
    service: Service,
) -> Result<Value, OperatorError> {
    authorize(roles)?;
    let breaker = client.breaker(service);
    breaker.reset().await;
    tracing::warn!(breaker = breaker.name(), "circuit breaker reset by operator");
    Ok(json!({ "breaker": breaker.name(), "state": breaker.state().await }))
}

pub async fn metrics_summary<S: AsRef<str>>(
    client: &ResilientClient,
    roles: &[S],
) -> Result<Value, OperatorError> {
    authorize(roles)?;
    Ok(client.metrics().summary().await)
}

pub async fn health_report<S: AsRef<str>>(
    client: &ResilientClient,
    roles: &[S],
) -> Result<Value, OperatorError> {
    authorize(roles)?;
    Ok(serde_json::to_value(health::detailed_health(client).await)?)
}

/// Latest `limit` receipt log entries plus totals over the whole log.
pub async fn receipt_log<S: AsRef<str>>(
    client: &ResilientClient,
    roles: &[S],
    limit: usize,
) -> Result<Value, OperatorError> {
    authorize(roles)?;
    let store = client.store().ok_or(OperatorError::StoreUnavailable)?;
    Ok(json!({
        "recent": store.recent_receipt_log(limit)?,
        "stats": store.receipt_log_stats()?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EbarimtConfig;
    use crate::http_client::ScriptedHttpClient;
    use std::sync::Arc;

    fn client() -> ResilientClient {
        ResilientClient::builder(EbarimtConfig::default())
            .with_http_client(Arc::new(ScriptedHttpClient::default()))
            .build()
    }

    #[test]
    fn only_operator_roles_are_authorized() {
        assert!(authorize(&["Accounts User", "System Manager"]).is_ok());
        assert!(authorize(&["Administrator"]).is_ok());
        assert!(matches!(
            authorize(&["Accounts User"]),
            Err(OperatorError::PermissionDenied)
        ));
        assert!(authorize::<&str>(&[]).is_err());
    }

    #[tokio::test]
    async fn actions_refuse_without_role() {
        let client = client();
        let roles = ["Sales User"];
        assert!(queue_status(&client, &roles).await.is_err());
        assert!(retry_failed_items(&client, &roles).await.is_err());
        assert!(reset_circuit_breaker(&client, &roles, Service::Pos).await.is_err());
        assert!(metrics_summary(&client, &roles).await.is_err());
        assert!(matches!(
            receipt_log(&client, &roles, 10).await,
            Err(OperatorError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn receipt_log_requires_the_store() {
        assert!(matches!(
            receipt_log(&client(), &["System Manager"], 10).await,
            Err(OperatorError::StoreUnavailable)
        ));
    }

    #[tokio::test]
    async fn reset_closes_an_open_breaker() {
        let client = client();
        let breaker = client.breaker(Service::Pos);
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        assert!(breaker.is_open().await);

        let result = reset_circuit_breaker(&client, &["Administrator"], Service::Pos)
            .await
            .expect("reset");
        assert_eq!(result["state"], "closed");
        assert!(!breaker.is_open().await);
    }

    #[tokio::test]
    async fn queue_status_reports_backend() {
        let status = queue_status(&client(), &["System Manager"])
            .await
            .expect("status");
        assert_eq!(status["source"], "cache");
        assert_eq!(status["pending"], 0);
    }
}
