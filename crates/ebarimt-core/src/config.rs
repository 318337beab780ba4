//! Client configuration, resolved once at construction.
//!
//! Every section has documented defaults. [`EbarimtConfig::from_env`] overlays
//! `EBARIMT_*` environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `EBARIMT_ENV` | `api.environment` (`staging` or `production`) |
//! | `EBARIMT_POS_URL` | `api.pos.primary` |
//! | `EBARIMT_FALLBACK_URLS` | `api.pos.fallbacks` (comma separated) |
//! | `EBARIMT_USERNAME` / `EBARIMT_PASSWORD` | `api.username` / `api.password` |
//! | `EBARIMT_TIMEOUT_SECS` | `api.request_timeout` |
//! | `EBARIMT_DEBUG_PAYLOADS` | `api.debug_payloads` |
//! | `EBARIMT_RETRY_MAX_RETRIES` | `retry.max_retries` |
//! | `EBARIMT_RETRY_JITTER` | `retry.backoff` jitter |
//! | `EBARIMT_QUEUE_MAX_RETRIES` | `queue.max_retries` |
//! | `EBARIMT_QUEUE_BATCH_SIZE` | `queue.batch_size` |
//! | `EBARIMT_HOME` | `store` directory |

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use ebarimt_store::StoreConfig;
use serde::Serialize;
use thiserror::Error;

use crate::auth::Credentials;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::rate_limiter::RateLimiterConfig;
use crate::retry::RetryConfig;

const PROXY_BASE: &str = "https://api.frappe.mn";
const IP_FALLBACK: &str = "http://103.153.141.167";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {name}: {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(name: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.to_owned(),
            value: value.to_owned(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Environment {
    #[default]
    Staging,
    Production,
}

impl Environment {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "Staging",
            Self::Production => "Production",
        }
    }
}

impl Display for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "staging" | "test" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(ConfigError::invalid(
                "EBARIMT_ENV",
                value,
                "expected staging or production",
            )),
        }
    }
}

/// Primary base URL and ordered fallbacks of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEndpoints {
    pub primary: String,
    pub fallbacks: Vec<String>,
}

impl ServiceEndpoints {
    pub fn new(primary: impl Into<String>, fallbacks: &[&str]) -> Self {
        Self {
            primary: primary.into(),
            fallbacks: fallbacks.iter().map(|url| (*url).to_owned()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub environment: Environment,
    pub pos: ServiceEndpoints,
    pub public_api: ServiceEndpoints,
    pub itc: ServiceEndpoints,
    /// OAuth2 token endpoints, primary first.
    pub token_urls: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Duration,
    /// Log request and response bodies of API calls.
    pub debug_payloads: bool,
}

impl ApiConfig {
    pub fn for_environment(environment: Environment) -> Self {
        let (pos_path, public_api, itc, auth_path, auth_direct, realm) = match environment {
            Environment::Staging => (
                "/test/rest",
                ServiceEndpoints::new(
                    format!("{PROXY_BASE}/ebarimt-staging"),
                    &["https://st-api.ebarimt.mn"],
                ),
                ServiceEndpoints::new(
                    format!("{PROXY_BASE}/itc-service-staging"),
                    &["https://st-service.itc.gov.mn"],
                ),
                "/auth/itc-staging/",
                "https://st.auth.itc.gov.mn/auth/",
                "Staging",
            ),
            Environment::Production => (
                "/rest",
                ServiceEndpoints::new(
                    format!("{PROXY_BASE}/ebarimt-prod"),
                    &["https://api.ebarimt.mn"],
                ),
                ServiceEndpoints::new(
                    format!("{PROXY_BASE}/itc-service-prod"),
                    &["https://service.itc.gov.mn"],
                ),
                "/auth/itc/",
                "https://auth.itc.gov.mn/auth/",
                "ITC",
            ),
        };

        let token_path = format!("realms/{realm}/protocol/openid-connect/token");
        Self {
            environment,
            pos: ServiceEndpoints {
                primary: format!("{PROXY_BASE}{pos_path}"),
                fallbacks: vec![format!("{IP_FALLBACK}{pos_path}")],
            },
            public_api,
            itc,
            token_urls: vec![
                format!("{PROXY_BASE}{auth_path}{token_path}"),
                format!("{IP_FALLBACK}{auth_path}{token_path}"),
                format!("{auth_direct}{token_path}"),
            ],
            username: None,
            password: None,
            request_timeout: Duration::from_secs(30),
            debug_payloads: false,
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Credentials::new(username.clone(), password.clone()))
            }
            _ => None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

/// Breakers per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub pos: CircuitBreakerConfig,
    pub public_api: CircuitBreakerConfig,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            pos: CircuitBreakerConfig::pos(),
            public_api: CircuitBreakerConfig::public_api(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub pos: RateLimiterConfig,
    pub public_api: RateLimiterConfig,
    /// Longest wait for a token before failing with rate limited.
    pub acquire_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            pos: RateLimiterConfig::pos(),
            public_api: RateLimiterConfig::public_api(),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyConfig {
    pub app: String,
    pub default_ttl: Duration,
    pub receipt_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            app: "ebarimt".to_owned(),
            default_ttl: Duration::from_secs(24 * 3600),
            receipt_ttl: Duration::from_secs(720 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub batch_size: usize,
    pub default_priority: i32,
    /// Pending count above which health reports a warning.
    pub high_water_mark: u64,
    /// Pause between drain passes of the worker.
    pub drain_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            batch_size: 10,
            default_priority: 5,
            high_water_mark: 100,
            drain_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EbarimtConfig {
    pub enabled: bool,
    pub api: ApiConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    /// Inline retry around each receipt call: three attempts in total.
    pub retry: RetryConfig,
    pub idempotency: IdempotencyConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
}

impl Default for EbarimtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api: ApiConfig::default(),
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::exponential(2),
            idempotency: IdempotencyConfig::default(),
            queue: QueueConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl EbarimtConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for `EBARIMT_*` names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let environment = match var("EBARIMT_ENV") {
            Some(value) => value.parse()?,
            None => Environment::default(),
        };
        let mut config = Self {
            api: ApiConfig::for_environment(environment),
            ..Self::default()
        };

        if let Some(url) = var("EBARIMT_POS_URL") {
            config.api.pos.primary = url.trim().to_owned();
        }
        if let Some(urls) = var("EBARIMT_FALLBACK_URLS") {
            config.api.pos.fallbacks = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_owned)
                .collect();
        }
        config.api.username = var("EBARIMT_USERNAME");
        config.api.password = var("EBARIMT_PASSWORD");
        if let Some(value) = var("EBARIMT_TIMEOUT_SECS") {
            config.api.request_timeout = Duration::from_secs(parse_number("EBARIMT_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = var("EBARIMT_DEBUG_PAYLOADS") {
            config.api.debug_payloads = parse_flag("EBARIMT_DEBUG_PAYLOADS", &value)?;
        }
        if let Some(value) = var("EBARIMT_ENABLED") {
            config.enabled = parse_flag("EBARIMT_ENABLED", &value)?;
        }
        if let Some(value) = var("EBARIMT_RETRY_MAX_RETRIES") {
            config.retry.max_retries = parse_number("EBARIMT_RETRY_MAX_RETRIES", &value)?;
        }
        if let Some(value) = var("EBARIMT_RETRY_JITTER") {
            config.retry = config.retry.with_jitter(parse_flag("EBARIMT_RETRY_JITTER", &value)?);
        }
        if let Some(value) = var("EBARIMT_QUEUE_MAX_RETRIES") {
            config.queue.max_retries = parse_number("EBARIMT_QUEUE_MAX_RETRIES", &value)?;
        }
        if let Some(value) = var("EBARIMT_QUEUE_BATCH_SIZE") {
            config.queue.batch_size = parse_number("EBARIMT_QUEUE_BATCH_SIZE", &value)?;
        }
        if let Some(home) = var("EBARIMT_HOME") {
            config.store = StoreConfig::in_dir(home);
        }

        Ok(config)
    }

    pub fn validate(&self) -> ConfigReport {
        let mut issues = Vec::new();

        if !self.enabled {
            issues.push(ConfigIssue::info("enabled", "eBarimt integration is disabled"));
            return ConfigReport { issues };
        }

        if self.api.pos.primary.trim().is_empty() {
            issues.push(ConfigIssue::error("api.pos", "POS API URL is required"));
        }
        if self.api.pos.fallbacks.is_empty() {
            issues.push(ConfigIssue::info(
                "api.pos.fallbacks",
                "no fallback POS URL, a proxy outage stops receipts",
            ));
        }
        if self.api.credentials().is_none() {
            issues.push(ConfigIssue::warning(
                "api.credentials",
                "API username and password are not set, ITC lookups will fail",
            ));
        }
        if self.api.request_timeout.is_zero() {
            issues.push(ConfigIssue::error("api.request_timeout", "request timeout must be positive"));
        }
        for (field, breaker) in [
            ("breaker.pos", &self.breaker.pos),
            ("breaker.public_api", &self.breaker.public_api),
        ] {
            if breaker.failure_threshold == 0 {
                issues.push(ConfigIssue::error(field, "failure threshold must be at least 1"));
            }
            if breaker.half_open_max_calls == 0 {
                issues.push(ConfigIssue::error(field, "half-open call limit must be at least 1"));
            }
        }
        for (field, limiter) in [
            ("rate_limit.pos", &self.rate_limit.pos),
            ("rate_limit.public_api", &self.rate_limit.public_api),
        ] {
            if limiter.calls == 0 || limiter.period.is_zero() {
                issues.push(ConfigIssue::error(field, "rate limit needs a positive call count and period"));
            }
        }
        if self.queue.max_retries == 0 {
            issues.push(ConfigIssue::error("queue.max_retries", "queued receipts need at least one attempt"));
        }
        if self.queue.batch_size == 0 {
            issues.push(ConfigIssue::error("queue.batch_size", "drain batch size must be positive"));
        }
        if self.api.environment == Environment::Staging {
            issues.push(ConfigIssue::info("api.environment", "using the staging environment"));
        }

        ConfigReport { issues }
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(name, value, "expected a non-negative integer"))
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(name, value, "expected true or false")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigIssue {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ConfigIssue {
    fn new(field: &str, message: &str, severity: Severity) -> Self {
        Self {
            field: field.to_owned(),
            message: message.to_owned(),
            severity,
        }
    }

    pub fn error(field: &str, message: &str) -> Self {
        Self::new(field, message, Severity::Error)
    }

    pub fn warning(field: &str, message: &str) -> Self {
        Self::new(field, message, Severity::Warning)
    }

    pub fn info(field: &str, message: &str) -> Self {
        Self::new(field, message, Severity::Info)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigReport {
    pub issues: Vec<ConfigIssue>,
}

impl ConfigReport {
    pub fn is_valid(&self) -> bool {
        self.errors().next().is_none()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ConfigIssue> {
        self.with_severity(Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ConfigIssue> {
        self.with_severity(Severity::Warning)
    }

    fn with_severity(&self, severity: Severity) -> impl Iterator<Item = &ConfigIssue> {
        self.issues
            .iter()
            .filter(move |issue| issue.severity == severity)
    }

    /// Log errors and warnings, as done once at startup.
    pub fn log(&self) {
        for issue in self.errors() {
            tracing::error!(field = %issue.field, "config error: {}", issue.message);
        }
        for issue in self.warnings() {
            tracing::warn!(field = %issue.field, "config warning: {}", issue.message);
        }
    }
}
