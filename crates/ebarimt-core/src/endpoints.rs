//! Primary-plus-fallback base URLs for each eBarimt service.

use std::sync::Arc;

use serde_json::Value;

use crate::http_client::{HttpAuth, HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse};

/// eBarimt services reached by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// POS API on the local terminal: receipts.
    Pos,
    /// Public eBarimt API: reference data.
    PublicApi,
    /// ITC services: consumer lookup, requires a bearer token.
    Itc,
}

impl Service {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pos => "pos",
            Self::PublicApi => "public_api",
            Self::Itc => "itc",
        }
    }
}

/// One logical API call, independent of which base URL serves it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCall {
    pub service: Service,
    pub method: HttpMethod,
    /// Path appended to the base URL, starting with `/`.
    pub path: String,
    pub body: Option<Value>,
    pub auth_required: bool,
    /// Name used for metrics and logs.
    pub operation: String,
}

impl ApiCall {
    pub fn new(service: Service, method: HttpMethod, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            service,
            method,
            operation: path.trim_start_matches('/').to_owned(),
            path,
            body: None,
            auth_required: false,
        }
    }

    pub fn get(service: Service, path: impl Into<String>) -> Self {
        Self::new(service, HttpMethod::Get, path)
    }

    pub fn post(service: Service, path: impl Into<String>) -> Self {
        Self::new(service, HttpMethod::Post, path)
    }

    pub fn delete(service: Service, path: impl Into<String>) -> Self {
        Self::new(service, HttpMethod::Delete, path)
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_auth(mut self) -> Self {
        self.auth_required = true;
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }
}

/// Sends a call to the primary base URL and walks the fallbacks in order.
///
/// Only connection failures and timeouts move on to the next URL. Any HTTP
/// response, whatever its status, ends the walk.
#[derive(Clone)]
pub struct EndpointTransport {
    name: String,
    base_urls: Vec<String>,
    http: Arc<dyn HttpClient>,
    timeout_ms: u64,
}

impl EndpointTransport {
    pub fn new(
        name: impl Into<String>,
        primary: impl Into<String>,
        fallbacks: Vec<String>,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        let mut base_urls = vec![primary.into()];
        base_urls.extend(fallbacks);
        Self {
            name: name.into(),
            base_urls,
            http,
            timeout_ms: 30_000,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_urls(&self) -> &[String] {
        &self.base_urls
    }

    pub fn url_for(base: &str, path: &str) -> String {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn send(&self, call: &ApiCall, auth: &HttpAuth) -> Result<HttpResponse, HttpError> {
        let mut last_error: Option<HttpError> = None;
        let mut attempted = Vec::with_capacity(self.base_urls.len());

        for base in &self.base_urls {
            let url = Self::url_for(base, &call.path);
            let mut request = HttpRequest::new(call.method, url.clone())
                .with_auth(auth)
                .with_timeout_ms(self.timeout_ms);
            if let Some(body) = &call.body {
                request = request.with_json(body);
            }

            match self.http.execute(request).await {
                Ok(response) => return Ok(response),
                Err(error) if error.retryable() => {
                    tracing::warn!(service = %self.name, %url, %error, "endpoint unreachable, trying next");
                    attempted.push(url);
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        let kind = last_error
            .as_ref()
            .map_or(crate::http_client::HttpErrorKind::Connect, HttpError::kind);
        let detail = last_error.map_or_else(String::new, |error| error.message().to_owned());
        Err(HttpError::new(
            kind,
            format!(
                "{} connection failed after trying {}: {detail}",
                self.name,
                attempted.join(", ")
            ),
        ))
    }
}

impl std::fmt::Debug for EndpointTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointTransport")
            .field("name", &self.name)
            .field("base_urls", &self.base_urls)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{HttpErrorKind, ScriptedHttpClient};
    use serde_json::json;

    fn transport(http: &ScriptedHttpClient) -> EndpointTransport {
        EndpointTransport::new(
            "pos",
            "https://api.frappe.mn/test/rest",
            vec!["http://103.153.141.167/test/rest".to_string()],
            Arc::new(http.clone()),
        )
    }

    #[tokio::test]
    async fn connection_failure_moves_to_the_fallback() {
        let http = ScriptedHttpClient::default();
        http.push(Err(HttpError::connect("refused")));
        http.push_status(200, r#"{"billId":"B-1"}"#);

        let call = ApiCall::post(Service::Pos, "/receipt").with_json(json!({"totalAmount": 1}));
        let response = transport(&http).send(&call, &HttpAuth::None).await.expect("response");

        assert_eq!(response.status, 200);
        let urls: Vec<String> = http.requests().into_iter().map(|request| request.url).collect();
        assert_eq!(
            urls,
            vec![
                "https://api.frappe.mn/test/rest/receipt",
                "http://103.153.141.167/test/rest/receipt"
            ]
        );
        assert_eq!(
            http.requests()[0].headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn http_error_status_does_not_fall_back() {
        let http = ScriptedHttpClient::default();
        http.push_status(503, "busy");

        let call = ApiCall::get(Service::Pos, "/info");
        let response = transport(&http).send(&call, &HttpAuth::None).await.expect("response");

        assert_eq!(response.status, 503);
        assert_eq!(http.request_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_chain_keeps_the_last_error_kind() {
        let http = ScriptedHttpClient::new(Err(HttpError::timeout("slow")));

        let call = ApiCall::get(Service::Pos, "/info");
        let error = transport(&http).send(&call, &HttpAuth::None).await.expect_err("all down");

        assert_eq!(error.kind(), HttpErrorKind::Timeout);
        assert!(error.message().contains("103.153.141.167"));
        assert_eq!(http.request_count(), 2);
    }

    #[tokio::test]
    async fn bearer_auth_is_applied_to_every_attempt() {
        let http = ScriptedHttpClient::default();
        let call = ApiCall::get(Service::Itc, "/api/easy-register/api/info/consumer/AA00000000").with_auth();

        transport(&http)
            .send(&call, &HttpAuth::BearerToken("tok".to_string()))
            .await
            .expect("response");

        assert_eq!(
            http.requests()[0].headers.get("authorization").map(String::as_str),
            Some("Bearer tok")
        );
    }
}
