use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{RequestBuilder, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::config::{AppCredentials, Endpoints, ServiceEndpoint};
use crate::error::{Error, Result};
use crate::scope::{Scope, ScopeKind};

const MANAGED_IDENTITY_API_VERSION: &str = "2019-08-01";

/// A downstream service a credential can be issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    Graph,
    Management,
    LogAnalytics,
    Directory,
    ThreatIntel,
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Audience::Graph => write!(f, "graph"),
            Audience::Management => write!(f, "management"),
            Audience::LogAnalytics => write!(f, "log-analytics"),
            Audience::Directory => write!(f, "directory"),
            Audience::ThreatIntel => write!(f, "threat-intel"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Bearer,
    ApiKey(&'static str),
}

/// A secret bound to one scope and one audience.
///
/// The credential remembers the origin it was issued for and refuses to
/// attach itself to requests aimed anywhere else, including continuation
/// links handed back by the server.
#[derive(Debug, Clone)]
pub struct Credential {
    audience: Audience,
    scope: String,
    origin: String,
    secret: SecretString,
    scheme: Scheme,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn bearer(
        audience: Audience,
        scope: &Scope,
        endpoint: &ServiceEndpoint,
        token: SecretString,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            audience,
            scope: scope.to_string(),
            origin: endpoint.base_url.origin().ascii_serialization(),
            secret: token,
            scheme: Scheme::Bearer,
            expires_at,
        }
    }

    pub fn api_key(
        audience: Audience,
        scope: &Scope,
        endpoint: &ServiceEndpoint,
        header: &'static str,
        key: SecretString,
    ) -> Self {
        Self {
            audience,
            scope: scope.to_string(),
            origin: endpoint.base_url.origin().ascii_serialization(),
            secret: key,
            scheme: Scheme::ApiKey(header),
            expires_at: None,
        }
    }

    pub fn audience(&self) -> Audience {
        self.audience
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    /// Whether this credential may be presented to `url`.
    pub fn permits(&self, url: &Url) -> bool {
        url.origin().ascii_serialization() == self.origin
    }

    pub(crate) fn authorize(&self, request: RequestBuilder, url: &Url) -> Result<RequestBuilder> {
        if !self.permits(url) {
            return Err(Error::auth(
                &self.scope,
                format!(
                    "{} credential cannot be sent to {}",
                    self.audience,
                    url.origin().ascii_serialization()
                ),
            ));
        }
        if self.is_expired() {
            return Err(Error::auth(&self.scope, format!("{} credential expired", self.audience)));
        }
        Ok(match self.scheme {
            Scheme::Bearer => request.bearer_auth(self.secret.expose_secret()),
            Scheme::ApiKey(header) => request.header(header, self.secret.expose_secret()),
        })
    }
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, scope: &Scope, audience: Audience) -> Result<Credential>;
    fn name(&self) -> &str;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
}

/// Client-credentials grant for one app registration.
///
/// Tenant scopes get a token from their own tenant; every other scope kind
/// runs in the configured home tenant.
pub struct ClientSecretResolver {
    http: reqwest::Client,
    endpoints: Endpoints,
    app: AppCredentials,
    home_tenant: Option<String>,
    label: String,
}

impl ClientSecretResolver {
    pub fn new(
        http: reqwest::Client,
        endpoints: Endpoints,
        app: AppCredentials,
        home_tenant: Option<String>,
    ) -> Self {
        let label = format!("client-secret:{}", app.client_id);
        Self {
            http,
            endpoints,
            app,
            home_tenant,
            label,
        }
    }

    fn tenant_for(&self, scope: &Scope) -> Result<String> {
        let tenant = match scope.kind {
            ScopeKind::Tenant => scope.id.clone(),
            _ => self
                .home_tenant
                .clone()
                .ok_or_else(|| Error::auth(scope.to_string(), "no home tenant configured"))?,
        };
        if !is_valid_tenant_id(&tenant) {
            return Err(Error::auth(scope.to_string(), "malformed tenant identifier"));
        }
        Ok(tenant)
    }
}

#[async_trait]
impl CredentialResolver for ClientSecretResolver {
    #[instrument(skip(self), fields(scope = %scope, audience = %audience))]
    async fn resolve(&self, scope: &Scope, audience: Audience) -> Result<Credential> {
        if audience == Audience::ThreatIntel {
            return Err(Error::auth(scope.to_string(), "threat-intel does not accept Entra tokens"));
        }
        let endpoint = self.endpoints.get(audience)?;
        let tenant = self.tenant_for(scope)?;

        let token_url = format!(
            "{}/{tenant}/oauth2/v2.0/token",
            self.endpoints.login.as_str().trim_end_matches('/')
        );
        let token_scope = endpoint.token_scope();
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.expose_secret()),
            ("scope", token_scope.as_str()),
        ];

        let response = self
            .http
            .post(&token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::auth(scope.to_string(), format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let code = response
                .json::<TokenErrorResponse>()
                .await
                .ok()
                .and_then(|body| body.error)
                .unwrap_or_else(|| "unknown_error".to_string());
            if is_refusal(&code) {
                return Err(Error::GrantRefused {
                    scope: scope.to_string(),
                    code,
                });
            }
            return Err(Error::auth(
                scope.to_string(),
                format!("token endpoint returned HTTP {status} ({code})"),
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::auth(scope.to_string(), format!("unreadable token response: {e}")))?;

        debug!(%scope, %audience, "token acquired");
        let expires_at = token
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
        Ok(Credential::bearer(
            audience,
            scope,
            endpoint,
            SecretString::from(token.access_token),
            expires_at,
        ))
    }

    fn name(&self) -> &str {
        &self.label
    }
}

#[derive(Deserialize)]
struct ManagedIdentityToken {
    access_token: String,
    #[serde(default)]
    expires_on: Option<String>,
}

/// App Service managed identity. Only valid inside the home tenant.
pub struct ManagedIdentityResolver {
    http: reqwest::Client,
    endpoints: Endpoints,
    identity_endpoint: Url,
    identity_header: SecretString,
    home_tenant: Option<String>,
}

impl ManagedIdentityResolver {
    pub fn new(
        http: reqwest::Client,
        endpoints: Endpoints,
        identity_endpoint: Url,
        identity_header: SecretString,
        home_tenant: Option<String>,
    ) -> Self {
        Self {
            http,
            endpoints,
            identity_endpoint,
            identity_header,
            home_tenant,
        }
    }
}

#[async_trait]
impl CredentialResolver for ManagedIdentityResolver {
    #[instrument(skip(self), fields(scope = %scope, audience = %audience))]
    async fn resolve(&self, scope: &Scope, audience: Audience) -> Result<Credential> {
        if scope.kind == ScopeKind::Tenant && self.home_tenant.as_deref() != Some(scope.id.as_str()) {
            return Err(Error::auth(
                scope.to_string(),
                "managed identity cannot act outside the home tenant",
            ));
        }
        if audience == Audience::ThreatIntel {
            return Err(Error::auth(scope.to_string(), "threat-intel does not accept Entra tokens"));
        }
        let endpoint = self.endpoints.get(audience)?;

        let response = self
            .http
            .get(self.identity_endpoint.clone())
            .query(&[
                ("resource", endpoint.token_resource.as_str()),
                ("api-version", MANAGED_IDENTITY_API_VERSION),
            ])
            .header("X-IDENTITY-HEADER", self.identity_header.expose_secret())
            .send()
            .await
            .map_err(|e| Error::auth(scope.to_string(), format!("identity endpoint unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::auth(
                scope.to_string(),
                format!("identity endpoint returned HTTP {status}"),
            ));
        }

        let token: ManagedIdentityToken = response
            .json()
            .await
            .map_err(|e| Error::auth(scope.to_string(), format!("unreadable identity response: {e}")))?;

        let expires_at = token
            .expires_on
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
        Ok(Credential::bearer(
            audience,
            scope,
            endpoint,
            SecretString::from(token.access_token),
            expires_at,
        ))
    }

    fn name(&self) -> &str {
        "managed-identity"
    }
}

/// Static API key for the threat-intelligence service, sent as `x-apikey`.
pub struct ApiKeyResolver {
    endpoint: ServiceEndpoint,
    key: SecretString,
}

impl ApiKeyResolver {
    pub fn new(endpoint: ServiceEndpoint, key: SecretString) -> Self {
        Self { endpoint, key }
    }
}

#[async_trait]
impl CredentialResolver for ApiKeyResolver {
    async fn resolve(&self, scope: &Scope, audience: Audience) -> Result<Credential> {
        if audience != Audience::ThreatIntel {
            return Err(Error::auth(
                scope.to_string(),
                format!("api key is not valid for {audience}"),
            ));
        }
        Ok(Credential::api_key(
            audience,
            scope,
            &self.endpoint,
            "x-apikey",
            self.key.clone(),
        ))
    }

    fn name(&self) -> &str {
        "api-key"
    }
}

/// OAuth error codes meaning the app itself is not allowed in the tenant.
/// Other codes (`invalid_request`, `temporarily_unavailable`, ...) stay
/// plain auth failures.
fn is_refusal(code: &str) -> bool {
    matches!(code, "unauthorized_client" | "invalid_client")
}

/// Tenant ids are GUIDs or verified domain names.
fn is_valid_tenant_id(tenant: &str) -> bool {
    !tenant.is_empty()
        && tenant.len() <= 253
        && tenant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}
