use std::time::Duration;

use reqwest::{Response, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{instrument, warn};

use crate::config::{Config, RetryPolicy};
use crate::credential::Credential;
use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("tenantlens/", env!("CARGO_PKG_VERSION"));

/// Shared HTTP client honoring the configured request deadline.
pub fn build_http(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.limits.request_timeout)
        .build()
        .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))
}

/// Authenticated JSON client for downstream REST APIs.
///
/// Every call takes the credential to present; the credential itself refuses
/// URLs outside its audience. Throttling and transient gateway errors
/// (429, 502, 503, 504) are retried per the retry policy.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(http: reqwest::Client, retry: RetryPolicy) -> Self {
        Self { http, retry }
    }

    /// GET returning `None` on 404.
    #[instrument(skip(self, credential), fields(audience = %credential.audience()))]
    pub async fn get_optional_json<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        operation: &str,
        url: &Url,
    ) -> Result<Option<T>> {
        let response = self
            .send(credential, operation, url, |http| http.get(url.clone()))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response, operation, url)?;
        decode(response, operation).await.map(Some)
    }

    #[instrument(skip(self, credential), fields(audience = %credential.audience()))]
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        operation: &str,
        url: &Url,
    ) -> Result<T> {
        self.get_optional_json(credential, operation, url)
            .await?
            .ok_or_else(|| Error::fetch(operation, format!("{} returned HTTP 404", redact(url))))
    }

    #[instrument(skip(self, credential, body), fields(audience = %credential.audience()))]
    pub async fn post_json<B, T>(
        &self,
        credential: &Credential,
        operation: &str,
        url: &Url,
        body: &B,
    ) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let response = self
            .send(credential, operation, url, |http| http.post(url.clone()).json(body))
            .await?;
        let response = ensure_success(response, operation, url)?;
        decode(response, operation).await
    }

    /// PATCH with a JSON body; the response body is discarded.
    #[instrument(skip(self, credential, body), fields(audience = %credential.audience()))]
    pub async fn patch_json<B>(&self, credential: &Credential, operation: &str, url: &Url, body: &B) -> Result<()>
    where
        B: Serialize + Sync,
    {
        let response = self
            .send(credential, operation, url, |http| http.patch(url.clone()).json(body))
            .await?;
        ensure_success(response, operation, url)?;
        Ok(())
    }

    /// GET a text body, e.g. a CSV report.
    #[instrument(skip(self, credential), fields(audience = %credential.audience()))]
    pub async fn get_text(&self, credential: &Credential, operation: &str, url: &Url) -> Result<String> {
        let response = self
            .send(credential, operation, url, |http| http.get(url.clone()))
            .await?;
        let response = ensure_success(response, operation, url)?;
        response
            .text()
            .await
            .map_err(|e| Error::fetch(operation, format!("failed to read body: {e}")))
    }

    async fn send<F>(&self, credential: &Credential, operation: &str, url: &Url, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let request = credential.authorize(build(&self.http), url)?;
            let response = request
                .send()
                .await
                .map_err(|e| Error::fetch(operation, format!("request to {} failed: {e}", redact(url))))?;

            let status = response.status();
            if !is_retryable(status) {
                return Ok(response);
            }
            if attempt >= self.retry.max_retries {
                if status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(Error::RateLimited {
                        service: url.host_str().unwrap_or("downstream").to_string(),
                        attempts: attempt + 1,
                    });
                }
                return Err(Error::fetch(
                    operation,
                    format!("{} returned HTTP {status}", redact(url)),
                ));
            }

            let delay = retry_after(&response)
                .unwrap_or_else(|| self.retry.backoff(attempt))
                .min(self.retry.max_delay);
            attempt += 1;
            warn!(
                operation,
                %status,
                attempt,
                max_retries = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                "downstream throttled, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn ensure_success(response: Response, operation: &str, url: &Url) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::fetch(operation, format!("{} returned HTTP {status}", redact(url))))
    }
}

async fn decode<T: DeserializeOwned>(response: Response, operation: &str) -> Result<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::fetch(operation, format!("failed to read body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::malformed(operation, e.to_string()))
}

/// URL without its query string. Continuation tokens and filters stay out
/// of error messages.
fn redact(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceEndpoint;
    use crate::credential::Audience;
    use crate::scope::Scope;
    use secrecy::SecretString;
    use serde_json::Value;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    fn graph_credential(server: &MockServer) -> (Credential, ServiceEndpoint) {
        let endpoint = ServiceEndpoint::new(&format!("{}/graph/v1.0", server.uri()), &server.uri()).unwrap();
        let credential = Credential::bearer(
            Audience::Graph,
            &Scope::tenant("t1"),
            &endpoint,
            SecretString::from("token-1".to_string()),
            None,
        );
        (credential, endpoint)
    }

    #[tokio::test]
    async fn get_json_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/graph/v1.0/organization"))
            .and(header("Authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": []})))
            .expect(1)
            .mount(&server)
            .await;

        let (credential, endpoint) = graph_credential(&server);
        let client = ApiClient::new(reqwest::Client::new(), fast_retry(0));
        let json: Value = client
            .get_json(&credential, "get organization", &endpoint.url("organization").unwrap())
            .await
            .unwrap();
        assert_eq!(json["value"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn not_found_is_none_for_optional_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (credential, endpoint) = graph_credential(&server);
        let client = ApiClient::new(reqwest::Client::new(), fast_retry(0));
        let url = endpoint.url("users/missing").unwrap();
        let found: Option<Value> = client
            .get_optional_json(&credential, "get user", &url)
            .await
            .unwrap();
        assert!(found.is_none());

        let err = client.get_json::<Value>(&credential, "get user", &url).await.unwrap_err();
        assert_eq!(err.kind(), "fetch");
    }

    #[tokio::test]
    async fn retries_throttled_request_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let (credential, endpoint) = graph_credential(&server);
        let client = ApiClient::new(reqwest::Client::new(), fast_retry(3));
        let json: Value = client
            .get_json(&credential, "list users", &endpoint.url("users").unwrap())
            .await
            .unwrap();
        assert_eq!(json["ok"], true);
    }

    #[tokio::test]
    async fn exhausted_throttling_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let (credential, endpoint) = graph_credential(&server);
        let client = ApiClient::new(reqwest::Client::new(), fast_retry(2));
        let err = client
            .get_json::<Value>(&credential, "list users", &endpoint.url("users").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let (credential, endpoint) = graph_credential(&server);
        let client = ApiClient::new(reqwest::Client::new(), fast_retry(3));
        let err = client
            .get_json::<Value>(&credential, "list users", &endpoint.url("users").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "fetch");
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn invalid_json_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
            .mount(&server)
            .await;

        let (credential, endpoint) = graph_credential(&server);
        let client = ApiClient::new(reqwest::Client::new(), fast_retry(0));
        let err = client
            .get_json::<Value>(&credential, "list users", &endpoint.url("users").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "malformed");
    }

    #[tokio::test]
    async fn refuses_to_send_credential_to_other_origin() {
        let server = MockServer::start().await;
        let other = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&other)
            .await;

        let (credential, _) = graph_credential(&server);
        let client = ApiClient::new(reqwest::Client::new(), fast_retry(0));
        let url = Url::parse(&format!("{}/graph/v1.0/users", other.uri())).unwrap();
        let err = client.get_json::<Value>(&credential, "list users", &url).await.unwrap_err();
        assert_eq!(err.kind(), "auth");
    }

    #[test]
    fn redact_drops_query() {
        let url = Url::parse("https://graph.microsoft.com/v1.0/users?$skiptoken=abc").unwrap();
        assert_eq!(redact(&url), "https://graph.microsoft.com/v1.0/users");
    }
}
