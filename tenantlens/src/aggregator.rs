use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, instrument};

use crate::collector::{Collected, Collector, FailureRecord};
use crate::config::{Config, Limits};
use crate::error::{Error, Result};
use crate::params::{Params, Request, validate};
use crate::response::{self, WirePayload};
use crate::scope::Scope;

/// One reporting handler: which parameters it needs, which scopes a request
/// expands into, and what it produces per scope.
#[async_trait]
pub trait UseCase: Send + Sync {
    type Output: Serialize + Send;

    fn name(&self) -> &'static str;

    fn required_params(&self) -> &'static [&'static str] {
        &[]
    }

    /// Upper bound on concurrent scopes, below the configured limit.
    fn max_concurrency(&self) -> Option<usize> {
        None
    }

    /// Expand validated parameters into scopes. Errors here are request-level.
    async fn scopes(&self, params: &Params) -> Result<Vec<Scope>>;

    async fn run_scope(&self, scope: Scope, params: &Params) -> Result<Self::Output>;
}

/// Drives a `UseCase` through validation, fan-out and serialization.
#[derive(Debug, Clone)]
pub struct Aggregator {
    limits: Limits,
    diagnostics: bool,
}

impl Aggregator {
    pub fn new(config: &Config) -> Self {
        Self {
            limits: config.limits.clone(),
            diagnostics: config.expose_diagnostics(),
        }
    }

    pub fn with_limits(limits: Limits, diagnostics: bool) -> Self {
        Self { limits, diagnostics }
    }

    pub async fn handle<U>(&self, use_case: &U, request: &Request) -> WirePayload
    where
        U: UseCase + ?Sized,
    {
        match self.aggregate(use_case, request).await {
            Ok(collected) => response::serialize(&collected),
            Err(e) => response::from_error(&e, self.diagnostics),
        }
    }

    #[instrument(skip_all, fields(use_case = use_case.name()))]
    pub async fn aggregate<U>(&self, use_case: &U, request: &Request) -> Result<Collected<U::Output>>
    where
        U: UseCase + ?Sized,
    {
        let started = Instant::now();
        let params = validate(request, use_case.required_params())?;

        let scopes = match tokio::time::timeout(self.limits.request_timeout, use_case.scopes(&params)).await {
            Ok(Ok(scopes)) => scopes,
            Ok(Err(e)) if e.is_scope_local() => return Ok(enumeration_failure(use_case.name(), &e)),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let e = Error::Timeout(self.limits.request_timeout);
                return Ok(enumeration_failure(use_case.name(), &e));
            }
        };

        let max_concurrency = use_case
            .max_concurrency()
            .map_or(self.limits.max_concurrency, |n| n.min(self.limits.max_concurrency));
        let collector = Collector::builder()
            .max_concurrency(max_concurrency)
            .scope_timeout(self.limits.scope_timeout)
            .request_deadline(started, self.limits.request_timeout)
            .build();

        let scope_count = scopes.len();
        let collected = collector
            .run(use_case.name(), scopes, |scope| use_case.run_scope(scope, &params))
            .await;

        info!(
            scopes = scope_count,
            results = collected.results.len(),
            failures = collected.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregation complete"
        );
        Ok(collected)
    }
}

/// Scope enumeration itself failed with a downstream error: reported as a
/// single failure against the use case so nothing is silently dropped.
fn enumeration_failure<T>(use_case: &str, error: &Error) -> Collected<T> {
    tracing::warn!(use_case, kind = error.kind(), error = %error, "scope enumeration failed");
    Collected {
        results: vec![],
        failures: vec![FailureRecord {
            scope: use_case.to_string(),
            operation: "enumerate scopes".to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use reqwest::StatusCode;
    use serde_json::Value;

    struct Echo {
        calls: AtomicUsize,
        failing: &'static [&'static str],
        enumeration: Option<fn() -> Error>,
    }

    impl Echo {
        fn new(failing: &'static [&'static str]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing,
                enumeration: None,
            }
        }
    }

    #[async_trait]
    impl UseCase for Echo {
        type Output = String;

        fn name(&self) -> &'static str {
            "echo"
        }

        fn required_params(&self) -> &'static [&'static str] {
            &["tenantId"]
        }

        async fn scopes(&self, params: &Params) -> Result<Vec<Scope>> {
            if let Some(make) = self.enumeration {
                return Err(make());
            }
            Ok(params.list("tenantId")?.into_iter().map(Scope::tenant).collect())
        }

        async fn run_scope(&self, scope: Scope, _params: &Params) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&scope.id.as_str()) {
                return Err(Error::auth(scope.to_string(), "token denied"));
            }
            Ok(scope.id)
        }
    }

    fn aggregator() -> Aggregator {
        Aggregator::with_limits(Limits::default(), false)
    }

    fn body(payload: &WirePayload) -> Value {
        serde_json::from_slice(&payload.body).unwrap()
    }

    #[tokio::test]
    async fn missing_parameter_makes_no_scope_calls() {
        let echo = Echo::new(&[]);
        let payload = aggregator().handle(&echo, &Request::default()).await;
        assert_eq!(payload.status, StatusCode::BAD_REQUEST);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn partial_failure_is_ok() {
        let echo = Echo::new(&["b"]);
        let request = Request::from_query([("tenantId", "a,b,c")]);
        let payload = aggregator().handle(&echo, &request).await;
        assert_eq!(payload.status, StatusCode::OK);
        let json = body(&payload);
        assert_eq!(json["results"], serde_json::json!(["a", "c"]));
        assert_eq!(json["failures"][0]["scope"], "tenant:b");
    }

    #[tokio::test]
    async fn total_failure_is_server_error() {
        let echo = Echo::new(&["a", "b"]);
        let request = Request::from_query([("tenantId", "a,b")]);
        let payload = aggregator().handle(&echo, &request).await;
        assert_eq!(payload.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(&payload)["failures"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn downstream_enumeration_error_is_reported_as_failure() {
        let mut echo = Echo::new(&[]);
        echo.enumeration = Some(|| Error::fetch("list tenants", "HTTP 503"));
        let request = Request::from_query([("tenantId", "a")]);
        let payload = aggregator().handle(&echo, &request).await;
        assert_eq!(payload.status, StatusCode::INTERNAL_SERVER_ERROR);
        let json = body(&payload);
        assert_eq!(json["failures"][0]["scope"], "echo");
        assert_eq!(json["failures"][0]["kind"], "fetch");
    }

    #[tokio::test]
    async fn config_error_is_generic_server_error() {
        let mut echo = Echo::new(&[]);
        echo.enumeration = Some(|| Error::Config("no primary app configured".into()));
        let request = Request::from_query([("tenantId", "a")]);

        let payload = aggregator().handle(&echo, &request).await;
        assert_eq!(payload.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body(&payload).get("detail").is_none());

        let diagnostic = Aggregator::with_limits(Limits::default(), true);
        let payload = diagnostic.handle(&echo, &request).await;
        assert!(body(&payload)["detail"].as_str().unwrap().contains("no primary app"));
    }

    #[tokio::test]
    async fn repeated_requests_are_byte_identical() {
        let echo = Echo::new(&["b"]);
        let request = Request::from_query([("tenantId", "c,b,a")]);
        let first = aggregator().handle(&echo, &request).await;
        let second = aggregator().handle(&echo, &request).await;
        assert_eq!(first.body, second.body);
    }

    #[tokio::test(start_paused = true)]
    async fn use_case_can_lower_concurrency() {
        struct Serial(AtomicUsize, AtomicUsize);

        #[async_trait]
        impl UseCase for Serial {
            type Output = ();

            fn name(&self) -> &'static str {
                "serial"
            }

            fn max_concurrency(&self) -> Option<usize> {
                Some(1)
            }

            async fn scopes(&self, _params: &Params) -> Result<Vec<Scope>> {
                Ok((0..4).map(|i| Scope::tenant(i.to_string())).collect())
            }

            async fn run_scope(&self, _scope: Scope, _params: &Params) -> Result<()> {
                let now = self.0.fetch_add(1, Ordering::SeqCst) + 1;
                self.1.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.0.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let serial = Serial(AtomicUsize::new(0), AtomicUsize::new(0));
        let collected = aggregator().aggregate(&serial, &Request::default()).await.unwrap();
        assert_eq!(collected.results.len(), 4);
        assert_eq!(serial.1.load(Ordering::SeqCst), 1);
    }
}
