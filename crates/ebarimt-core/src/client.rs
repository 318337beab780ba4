//! Resilient eBarimt client.
//!
//! Every outbound call runs through the per-service interceptor chain
//! (circuit breaker, rate limiter, retry) and walks the service's fallback
//! URLs. Receipt submission adds idempotency above the chain and parks the
//! receipt in the offline queue when the POS API cannot be reached.

use std::sync::Arc;
use std::time::Instant;

use ebarimt_store::{ReceiptLogRecord, ReceiptLogStatus, Store};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::auth::TokenProvider;
use crate::cache::{Cache, MemoryCache, StoreCache};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::EbarimtConfig;
use crate::documents::DocumentStore;
use crate::endpoints::{ApiCall, EndpointTransport, Service};
use crate::error::{ClientError, QueueError};
use crate::http_client::{HttpAuth, HttpClient, HttpResponse, ReqwestHttpClient};
use crate::idempotency::IdempotencyManager;
use crate::logging::{self, ApiCallRecord, ReceiptEvent};
use crate::metrics::MetricsCollector;
use crate::middleware::{
    boxed, BoxFuture, CircuitBreakerInterceptor, Pipeline, RateLimitInterceptor, RetryInterceptor,
};
use crate::offline_queue::{
    OfflineQueue, ProcessReport, QueueItem, QueueStatus, ReceiptProcessor, SourceReference,
};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::receipt::{BillType, ReceiptResponse, ReceiptSubmission, SubmissionOutcome};
use crate::timestamp::UtcDateTime;

pub const QUEUED_MESSAGE: &str = "Receipt queued for processing when API is available";
const MAX_ERROR_BODY: usize = 200;

/// Transport, breaker, limiter and chain of one service.
struct Channel {
    transport: EndpointTransport,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    pipeline: Pipeline,
}

impl Channel {
    fn new(
        service: Service,
        breaker: CircuitBreakerConfig,
        limiter: RateLimiterConfig,
        config: &EbarimtConfig,
        http: &Arc<dyn HttpClient>,
        cache: &Arc<dyn Cache>,
    ) -> Self {
        let endpoints = match service {
            Service::Pos => &config.api.pos,
            Service::PublicApi => &config.api.public_api,
            Service::Itc => &config.api.itc,
        };
        let breaker = Arc::new(CircuitBreaker::new(service.as_str(), breaker, Arc::clone(cache)));
        let limiter = Arc::new(RateLimiter::new(service.as_str(), limiter));
        let pipeline = Pipeline::new()
            .with(CircuitBreakerInterceptor::new(Arc::clone(&breaker)))
            .with(RateLimitInterceptor::new(
                Arc::clone(&limiter),
                config.rate_limit.acquire_timeout,
            ))
            .with(RetryInterceptor::new(config.retry.clone()));
        let transport = EndpointTransport::new(
            service.as_str(),
            endpoints.primary.clone(),
            endpoints.fallbacks.clone(),
            Arc::clone(http),
        )
        .with_timeout_ms(request_timeout_ms(config));

        Self {
            transport,
            breaker,
            limiter,
            pipeline,
        }
    }
}

fn request_timeout_ms(config: &EbarimtConfig) -> u64 {
    u64::try_from(config.api.request_timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Builder for [`ResilientClient`].
///
/// Without an explicit cache the client uses the store's `kv_cache` table
/// when a store is given, and an in-process cache otherwise. Without an
/// explicit HTTP client it uses reqwest.
pub struct ResilientClientBuilder {
    config: EbarimtConfig,
    http: Option<Arc<dyn HttpClient>>,
    cache: Option<Arc<dyn Cache>>,
    store: Option<Store>,
}

impl ResilientClientBuilder {
    pub fn new(config: EbarimtConfig) -> Self {
        Self {
            config,
            http: None,
            cache: None,
            store: None,
        }
    }

    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> ResilientClient {
        let config = self.config;
        let http: Arc<dyn HttpClient> = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestHttpClient::new()),
        };
        let cache: Arc<dyn Cache> = match (self.cache, &self.store) {
            (Some(cache), _) => cache,
            (None, Some(store)) => Arc::new(StoreCache::new(store.clone())),
            (None, None) => Arc::new(MemoryCache::new()),
        };

        let pos = Channel::new(
            Service::Pos,
            config.breaker.pos,
            config.rate_limit.pos,
            &config,
            &http,
            &cache,
        );
        let public_api = Channel::new(
            Service::PublicApi,
            config.breaker.public_api,
            config.rate_limit.public_api,
            &config,
            &http,
            &cache,
        );
        let itc = Channel::new(
            Service::Itc,
            config.breaker.public_api,
            config.rate_limit.public_api,
            &config,
            &http,
            &cache,
        );

        let queue = OfflineQueue::open(self.store.as_ref(), Arc::clone(&cache))
            .with_breaker(Arc::clone(&pos.breaker))
            .with_max_retries(config.queue.max_retries)
            .with_default_priority(config.queue.default_priority);
        let tokens = TokenProvider::new(
            Arc::clone(&http),
            Arc::clone(&cache),
            config.api.token_urls.clone(),
            config.api.credentials(),
        )
        .with_timeout_ms(request_timeout_ms(&config));
        let idempotency = IdempotencyManager::new(Arc::clone(&cache), config.idempotency.app.clone())
            .with_default_ttl(config.idempotency.default_ttl)
            .with_receipt_ttl(config.idempotency.receipt_ttl);
        let metrics = MetricsCollector::new(Arc::clone(&cache));

        tracing::debug!(
            environment = %config.api.environment,
            cache = cache.name(),
            queue = queue.backend_name(),
            "eBarimt client ready"
        );

        ResilientClient {
            config,
            cache,
            store: self.store,
            pos,
            public_api,
            itc,
            tokens,
            idempotency,
            queue,
            metrics,
        }
    }
}

pub struct ResilientClient {
    config: EbarimtConfig,
    cache: Arc<dyn Cache>,
    store: Option<Store>,
    pos: Channel,
    public_api: Channel,
    itc: Channel,
    tokens: TokenProvider,
    idempotency: IdempotencyManager,
    queue: OfflineQueue,
    metrics: MetricsCollector,
}

impl ResilientClient {
    pub fn builder(config: EbarimtConfig) -> ResilientClientBuilder {
        ResilientClientBuilder::new(config)
    }

    pub const fn config(&self) -> &EbarimtConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub const fn store(&self) -> Option<&Store> {
        self.store.as_ref()
    }

    pub const fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub const fn idempotency(&self) -> &IdempotencyManager {
        &self.idempotency
    }

    pub const fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub const fn tokens(&self) -> &TokenProvider {
        &self.tokens
    }

    pub fn breaker(&self, service: Service) -> &Arc<CircuitBreaker> {
        &self.channel(service).breaker
    }

    pub fn limiter(&self, service: Service) -> &Arc<RateLimiter> {
        &self.channel(service).limiter
    }

    pub fn base_urls(&self, service: Service) -> &[String] {
        self.channel(service).transport.base_urls()
    }

    /// Interceptors wrapped around calls to `service`, outermost first.
    pub fn interceptor_names(&self, service: Service) -> Vec<&'static str> {
        self.channel(service).pipeline.names()
    }

    const fn channel(&self, service: Service) -> &Channel {
        match service {
            Service::Pos => &self.pos,
            Service::PublicApi => &self.public_api,
            Service::Itc => &self.itc,
        }
    }

    /// Send `call` through its service's chain. Non-2xx responses become
    /// [`ClientError::Api`]. A 401 on an authenticated call refreshes the
    /// token once and repeats the call.
    pub async fn request(&self, call: ApiCall) -> Result<HttpResponse, ClientError> {
        let auth = if call.auth_required {
            self.tokens.auth().await?
        } else {
            HttpAuth::None
        };

        match self.dispatch(&call, &auth).await {
            Err(ClientError::Api { status: 401, .. }) if call.auth_required => {
                tracing::info!(operation = %call.operation, "token rejected, refreshing");
                self.tokens.clear().await;
                let auth = HttpAuth::BearerToken(self.tokens.token(true).await?);
                self.dispatch(&call, &auth).await
            }
            outcome => outcome,
        }
    }

    /// [`Self::request`] decoding the body as JSON. An empty body is `null`.
    pub async fn get_json(&self, call: ApiCall) -> Result<Value, ClientError> {
        let operation = call.operation.clone();
        let response = self.request(call).await?;
        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        decode(&response, &operation)
    }

    async fn dispatch(&self, call: &ApiCall, auth: &HttpAuth) -> Result<HttpResponse, ClientError> {
        let channel = self.channel(call.service);
        let started = Instant::now();
        let transport = move || {
            boxed(async move {
                let response = channel.transport.send(call, auth).await?;
                if response.is_success() {
                    Ok(response)
                } else {
                    Err(ClientError::Api {
                        status: response.status,
                        message: api_error_message(&response),
                    })
                }
            })
        };

        let result = channel.pipeline.execute(&transport).await;
        self.observe(call, &result, elapsed_ms(started)).await;
        result
    }

    async fn observe(
        &self,
        call: &ApiCall,
        result: &Result<HttpResponse, ClientError>,
        duration_ms: u64,
    ) {
        let url = self
            .base_urls(call.service)
            .first()
            .map_or_else(|| call.path.clone(), |base| EndpointTransport::url_for(base, &call.path));
        let request = call.body.as_ref().map(Value::to_string);
        let error = result.as_ref().err().map(ToString::to_string);
        let status_code = match result {
            Ok(response) => Some(response.status),
            Err(ClientError::Api { status, .. }) => Some(*status),
            Err(_) => None,
        };

        logging::api_call(
            &ApiCallRecord {
                method: call.method.as_str(),
                url: &url,
                status_code,
                duration_ms,
                request: request.as_deref(),
                response: result.as_ref().ok().map(|response| response.body.as_str()),
                error: error.as_deref(),
            },
            self.config.api.debug_payloads,
        );

        self.metrics
            .record_api_call(&call.operation, result.is_ok(), duration_ms as f64)
            .await;
        if let Err(error) = result {
            self.metrics
                .record_error(error.category(), Some(&call.operation))
                .await;
        }
    }

    /// Submit a receipt for one version of a source document.
    ///
    /// A version already submitted returns the earlier receipt without a
    /// call, and a document with a receipt still in the offline queue returns
    /// that queued item. Unreachable API, open breaker or exhausted rate limit
    /// queue the receipt instead of failing. Validation failures are returned
    /// as errors.
    pub async fn submit_receipt(
        &self,
        submission: ReceiptSubmission,
    ) -> Result<SubmissionOutcome, ClientError> {
        let started = Instant::now();
        let key = self.idempotency.receipt_key(
            &submission.source.doctype,
            &submission.source.name,
            &submission.modified,
        );

        if let Some(outcome) = self.join_queued(&submission, &key).await {
            return Ok(outcome);
        }

        let attempt = self
            .idempotency
            .get_or_execute_with_key(&key, Some(self.idempotency.receipt_ttl()), || {
                self.post_receipt(&submission.payload)
            })
            .await;
        let duration_ms = elapsed_ms(started);

        match attempt {
            Ok((receipt, true)) => {
                tracing::info!(
                    source = %submission.source,
                    receipt_id = receipt.receipt_id(),
                    "receipt already submitted for this document version"
                );
                Ok(SubmissionOutcome::Duplicate(receipt))
            }
            Ok((receipt, false)) => {
                self.metrics
                    .record_receipt(submission.bill_type.as_str(), true, duration_ms as f64)
                    .await;
                logging::receipt_event(&ReceiptEvent {
                    event: "created",
                    invoice: &submission.source.name,
                    receipt_id: receipt.receipt_id(),
                    lottery: receipt.lottery.as_deref(),
                    amount: submission.amount,
                    bill_type: Some(submission.bill_type.as_str()),
                    error: None,
                });
                self.log_receipt(ReceiptLogRecord {
                    receipt_id: receipt.receipt_id().map(str::to_owned),
                    lottery: receipt.lottery.clone(),
                    qr_data: receipt.qr_data.clone(),
                    ..log_record(&submission, ReceiptLogStatus::Success, duration_ms)
                });
                Ok(SubmissionOutcome::Submitted(receipt))
            }
            Err(error) if error.is_queueable() => {
                self.queue_submission(&submission, &error, duration_ms).await
            }
            Err(error) => {
                self.metrics
                    .record_receipt(submission.bill_type.as_str(), false, duration_ms as f64)
                    .await;
                self.record_failure(&submission, &error.to_string(), duration_ms);
                Err(error)
            }
        }
    }

    /// Attach a submission to the receipt already queued for its document.
    ///
    /// The same version returns the queued item. A newer version replaces the
    /// payload of a Pending item. Versions with a cached receipt, and newer
    /// versions of an item already being sent, go the normal way.
    async fn join_queued(
        &self,
        submission: &ReceiptSubmission,
        key: &str,
    ) -> Option<SubmissionOutcome> {
        let item = match self.queue.find_active(&submission.source).await {
            Ok(item) => item?,
            Err(error) => {
                tracing::warn!(source = %submission.source, %error, "offline queue lookup failed");
                return None;
            }
        };

        if !item.is_version(&submission.modified) {
            if item.status != QueueStatus::Pending
                || matches!(self.idempotency.check(key).await, Ok(Some(_)))
            {
                return None;
            }
            if let Err(error) = self
                .queue
                .replace_pending(&item.id, &submission.modified, submission.payload.clone())
                .await
            {
                tracing::warn!(queue_id = %item.id, %error, "could not update queued receipt");
                return None;
            }
            self.log_receipt(ReceiptLogRecord {
                queue_id: Some(item.id.clone()),
                ..log_record(submission, ReceiptLogStatus::Queued, 0)
            });
        } else {
            tracing::info!(
                source = %submission.source,
                queue_id = %item.id,
                "receipt for this document version is already queued"
            );
        }

        Some(SubmissionOutcome::Queued {
            queue_id: item.id,
            message: QUEUED_MESSAGE.to_owned(),
        })
    }

    async fn queue_submission(
        &self,
        submission: &ReceiptSubmission,
        cause: &ClientError,
        duration_ms: u64,
    ) -> Result<SubmissionOutcome, ClientError> {
        let enqueued = self
            .queue
            .enqueue_version(
                &submission.source,
                &submission.modified,
                submission.payload.clone(),
                submission.priority,
            )
            .await;

        match enqueued {
            Ok(outcome) => {
                let queue_id = outcome.id().to_owned();
                tracing::warn!(
                    source = %submission.source,
                    %queue_id,
                    error = %cause,
                    "eBarimt unavailable, receipt queued"
                );
                logging::receipt_event(&ReceiptEvent {
                    event: "queued",
                    invoice: &submission.source.name,
                    amount: submission.amount,
                    bill_type: Some(submission.bill_type.as_str()),
                    ..ReceiptEvent::default()
                });
                self.log_receipt(ReceiptLogRecord {
                    queue_id: Some(queue_id.clone()),
                    error: Some(cause.to_string()),
                    ..log_record(submission, ReceiptLogStatus::Queued, duration_ms)
                });
                self.record_queue_size().await;
                Ok(SubmissionOutcome::Queued {
                    queue_id,
                    message: QUEUED_MESSAGE.to_owned(),
                })
            }
            Err(queue_error) => {
                let message = format!("{cause}; offline queue: {queue_error}");
                self.record_failure(submission, &message, duration_ms);
                Err(ClientError::QueueUnavailable(message))
            }
        }
    }

    fn record_failure(&self, submission: &ReceiptSubmission, error: &str, duration_ms: u64) {
        logging::receipt_event(&ReceiptEvent {
            event: "failed",
            invoice: &submission.source.name,
            amount: submission.amount,
            bill_type: Some(submission.bill_type.as_str()),
            error: Some(error),
            ..ReceiptEvent::default()
        });
        self.log_receipt(ReceiptLogRecord {
            error: Some(error.to_owned()),
            ..log_record(submission, ReceiptLogStatus::Failed, duration_ms)
        });
    }

    fn log_receipt(&self, record: ReceiptLogRecord) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(error) = store.append_receipt_log(&record) {
            tracing::warn!(%error, source = %record.source_name, "failed to write receipt log");
        }
    }

    /// Cache a receipt sent from the queue so resubmitting the same document
    /// version is answered as a duplicate.
    async fn remember_receipt(
        &self,
        source: &SourceReference,
        modified: &str,
        receipt: &ReceiptResponse,
    ) {
        let stored = match serde_json::to_value(receipt) {
            Ok(value) => {
                self.idempotency
                    .store_receipt_result(&source.doctype, &source.name, modified, value)
                    .await
            }
            Err(error) => Err(error.into()),
        };
        if let Err(error) = stored {
            tracing::warn!(%source, %error, "failed to store idempotency record for queued receipt");
        }
    }

    /// `POST /receipt` through the POS chain, without idempotency.
    async fn post_receipt(&self, payload: &Value) -> Result<ReceiptResponse, ClientError> {
        let call = ApiCall::post(Service::Pos, "/receipt")
            .with_json(payload.clone())
            .with_operation("receipt");
        let response = self.request(call).await?;
        let receipt: ReceiptResponse = decode(&response, "receipt")?;
        if receipt.is_rejected() {
            return Err(ClientError::InvalidResponse(
                receipt
                    .message
                    .unwrap_or_else(|| "receipt rejected by POS API".to_owned()),
            ));
        }
        Ok(receipt)
    }

    /// Drain one batch of the offline queue and refresh the queue-size gauge.
    pub async fn drain_queue(
        &self,
        documents: &dyn DocumentStore,
    ) -> Result<ProcessReport, QueueError> {
        let report = self
            .queue
            .process_queue(self.config.queue.batch_size, self, documents)
            .await?;
        self.record_queue_size().await;
        Ok(report)
    }

    /// Publish the pending count as the `offline_queue_size` gauge.
    pub async fn record_queue_size(&self) -> Option<u64> {
        match self.queue.queue_stats().await {
            Ok(stats) => {
                self.metrics.record_queue_size(stats.pending).await;
                Some(stats.pending)
            }
            Err(error) => {
                tracing::warn!(%error, "queue stats unavailable");
                None
            }
        }
    }

    /// POS terminal status.
    pub async fn get_info(&self) -> Result<Value, ClientError> {
        self.get_json(ApiCall::get(Service::Pos, "/info")).await
    }

    pub async fn get_receipt_info(&self, receipt_id: &str) -> Result<Value, ClientError> {
        let path = format!("/receipt/{}", urlencoding::encode(receipt_id));
        self.get_json(ApiCall::get(Service::Pos, path).with_operation("receipt_info"))
            .await
    }

    /// Ask the POS terminal to upload stored receipts.
    pub async fn send_data(&self) -> Result<Value, ClientError> {
        self.get_json(ApiCall::get(Service::Pos, "/sendData")).await
    }

    /// Void an unconfirmed B2C receipt. `date` defaults to now.
    pub async fn void_receipt(
        &self,
        receipt_id: &str,
        date: Option<&str>,
    ) -> Result<Value, ClientError> {
        let date = date.map_or_else(|| UtcDateTime::now().format_receipt_date(), str::to_owned);
        let call = ApiCall::delete(Service::Pos, "/receipt")
            .with_json(json!({ "id": receipt_id, "date": date }))
            .with_operation("void_receipt");
        let result = self.get_json(call).await;
        self.metrics.record_return(result.is_ok()).await;
        result
    }

    pub async fn get_district_codes(&self) -> Result<Vec<Value>, ClientError> {
        let body = self
            .get_json(
                ApiCall::get(Service::PublicApi, "/api/info/check/getBranchInfo")
                    .with_operation("district_codes"),
            )
            .await?;
        Ok(data_rows(body, "district_codes"))
    }

    pub async fn get_tax_codes(&self) -> Result<Vec<Value>, ClientError> {
        let body = self
            .get_json(
                ApiCall::get(Service::PublicApi, "/api/receipt/receipt/getProductTaxCode")
                    .with_operation("tax_codes"),
            )
            .await?;
        Ok(data_rows(body, "tax_codes"))
    }

    /// Consumer registration by national registry number. Requires credentials.
    pub async fn lookup_consumer_by_regno(&self, regno: &str) -> Result<Value, ClientError> {
        let path = format!(
            "/api/easy-register/api/info/consumer/{}",
            urlencoding::encode(regno)
        );
        self.get_json(
            ApiCall::get(Service::Itc, path)
                .with_auth()
                .with_operation("consumer_lookup"),
        )
        .await
    }
}

impl ReceiptProcessor for ResilientClient {
    fn process<'a>(
        &'a self,
        item: &'a QueueItem,
    ) -> BoxFuture<'a, Result<ReceiptResponse, ClientError>> {
        Box::pin(async move {
            let started = Instant::now();
            let bill_type = item
                .payload
                .get("billType")
                .and_then(Value::as_str)
                .and_then(|value| value.parse::<BillType>().ok())
                .unwrap_or_default();
            let result = self.post_receipt(&item.payload).await;
            self.metrics
                .record_receipt(bill_type.as_str(), result.is_ok(), elapsed_ms(started) as f64)
                .await;
            if let (Ok(receipt), Some(modified)) = (&result, &item.document_modified) {
                self.remember_receipt(&item.source, modified, receipt).await;
            }
            result
        })
    }
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("environment", &self.config.api.environment)
            .field("cache", &self.cache.name())
            .field("queue", &self.queue)
            .field("pos", &self.pos.transport)
            .finish()
    }
}

fn log_record(
    submission: &ReceiptSubmission,
    status: ReceiptLogStatus,
    duration_ms: u64,
) -> ReceiptLogRecord {
    ReceiptLogRecord {
        id: None,
        source_doctype: submission.source.doctype.clone(),
        source_name: submission.source.name.clone(),
        status,
        bill_type: Some(submission.bill_type.as_str().to_owned()),
        receipt_id: None,
        lottery: None,
        qr_data: None,
        queue_id: None,
        error: None,
        duration_ms: Some(duration_ms),
        created_at: UtcDateTime::now().format_rfc3339(),
    }
}

fn decode<T: DeserializeOwned>(response: &HttpResponse, operation: &str) -> Result<T, ClientError> {
    response
        .json()
        .map_err(|error| ClientError::InvalidResponse(format!("{operation} response: {error}")))
}

/// `message` or `msg` of a JSON error body, else the start of the raw body.
fn api_error_message(response: &HttpResponse) -> String {
    let from_json = serde_json::from_str::<Value>(&response.body)
        .ok()
        .and_then(|body| {
            ["message", "msg", "error"]
                .iter()
                .find_map(|field| body.get(*field).and_then(Value::as_str).map(str::to_owned))
        });
    from_json.unwrap_or_else(|| {
        let body = response.body.trim();
        if body.is_empty() {
            format!("HTTP {}", response.status)
        } else {
            body.chars().take(MAX_ERROR_BODY).collect()
        }
    })
}

/// `data` rows of a public API envelope `{ status: 200, data: [...] }`.
fn data_rows(body: Value, operation: &str) -> Vec<Value> {
    let status = body.get("status").and_then(Value::as_i64);
    if status != Some(200) {
        tracing::warn!(operation, ?status, "public API returned no data");
        return Vec::new();
    }
    match body.get("data") {
        Some(Value::Array(rows)) => rows.clone(),
        _ => Vec::new(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
