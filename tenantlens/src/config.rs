use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use secrecy::SecretString;
use serde::Deserialize;

use crate::credential::Audience;
use crate::directory::TenantRecord;
use crate::error::{Error, Result};

const DEFAULT_LOGIN_URL: &str = "https://login.microsoftonline.com";
const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_GRAPH_RESOURCE: &str = "https://graph.microsoft.com";
const DEFAULT_MANAGEMENT_URL: &str = "https://management.azure.com";
const DEFAULT_LOG_ANALYTICS_URL: &str = "https://api.loganalytics.io/v1";
const DEFAULT_LOG_ANALYTICS_RESOURCE: &str = "https://api.loganalytics.io";
const DEFAULT_VIRUSTOTAL_URL: &str = "https://www.virustotal.com/api/v3";
const DEFAULT_ASR_API_VERSION: &str = "2024-04-01";
const DEFAULT_BIND: &str = "0.0.0.0:7071";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Development,
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            other => Err(Error::Config(format!(
                "unknown environment: {other} (valid: production, development)"
            ))),
        }
    }
}

/// A downstream service: where requests go and which token resource they
/// need. Credentials are only ever sent to `base_url`'s origin.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub base_url: Url,
    pub token_resource: String,
}

impl ServiceEndpoint {
    pub fn new(base_url: &str, token_resource: &str) -> Result<Self> {
        Ok(Self {
            base_url: parse_url("endpoint", base_url)?,
            token_resource: token_resource.trim_end_matches('/').to_string(),
        })
    }

    /// `path` appended to the base URL, keeping the base path intact.
    pub fn url(&self, path: &str) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        parse_url("request", &format!("{base}/{path}"))
    }

    pub fn token_scope(&self) -> String {
        format!("{}/.default", self.token_resource)
    }
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub login: Url,
    pub graph: ServiceEndpoint,
    pub management: ServiceEndpoint,
    pub log_analytics: ServiceEndpoint,
    pub directory: Option<ServiceEndpoint>,
    pub threat_intel: ServiceEndpoint,
}

impl Endpoints {
    pub fn public_cloud() -> Result<Self> {
        Ok(Self {
            login: parse_url("login", DEFAULT_LOGIN_URL)?,
            graph: ServiceEndpoint::new(DEFAULT_GRAPH_URL, DEFAULT_GRAPH_RESOURCE)?,
            management: ServiceEndpoint::new(DEFAULT_MANAGEMENT_URL, DEFAULT_MANAGEMENT_URL)?,
            log_analytics: ServiceEndpoint::new(
                DEFAULT_LOG_ANALYTICS_URL,
                DEFAULT_LOG_ANALYTICS_RESOURCE,
            )?,
            directory: None,
            threat_intel: ServiceEndpoint::new(DEFAULT_VIRUSTOTAL_URL, "")?,
        })
    }

    /// Route every audience to one origin, each under its own path prefix.
    /// Used against local emulators and mock servers.
    pub fn single_origin(origin: &str) -> Result<Self> {
        let origin = origin.trim_end_matches('/');
        Ok(Self {
            login: parse_url("login", &format!("{origin}/login"))?,
            graph: ServiceEndpoint::new(&format!("{origin}/graph/v1.0"), origin)?,
            management: ServiceEndpoint::new(&format!("{origin}/arm"), origin)?,
            log_analytics: ServiceEndpoint::new(&format!("{origin}/loganalytics/v1"), origin)?,
            directory: Some(ServiceEndpoint::new(&format!("{origin}/directory"), origin)?),
            threat_intel: ServiceEndpoint::new(&format!("{origin}/vt/api/v3"), "")?,
        })
    }

    pub fn get(&self, audience: Audience) -> Result<&ServiceEndpoint> {
        match audience {
            Audience::Graph => Ok(&self.graph),
            Audience::Management => Ok(&self.management),
            Audience::LogAnalytics => Ok(&self.log_analytics),
            Audience::ThreatIntel => Ok(&self.threat_intel),
            Audience::Directory => self
                .directory
                .as_ref()
                .ok_or_else(|| Error::Config("tenant directory endpoint is not configured".into())),
        }
    }
}

/// One app registration used for the client-credentials grant.
#[derive(Debug, Clone)]
pub struct AppCredentials {
    pub client_id: String,
    pub client_secret: SecretString,
}

#[derive(Debug, Clone)]
pub enum IdentityMode {
    /// Client-credentials grant with the primary app in the home tenant.
    ClientSecret,
    /// App Service managed identity endpoint.
    Managed { endpoint: Url, header: SecretString },
}

#[derive(Debug, Clone)]
pub struct Limits {
    pub page_size: u32,
    pub max_pages: usize,
    pub max_concurrency: usize,
    pub scope_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            page_size: 999,
            max_pages: 100,
            max_concurrency: 8,
            scope_timeout: Duration::from_secs(60),
            // Azure Functions caps HTTP triggers at 230 seconds.
            request_timeout: Duration::from_secs(230),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Exponential backoff for `attempt` (0-based), capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runtime configuration, read once at startup and passed explicitly to
/// everything that needs it. Secrets come from the environment only; the
/// YAML override file carries non-secret settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub bind_addr: SocketAddr,
    pub home_tenant_id: Option<String>,
    pub identity: IdentityMode,
    pub primary_app: Option<AppCredentials>,
    pub backup_app: Option<AppCredentials>,
    pub compliance_app_id: Option<String>,
    pub virustotal_api_key: Option<SecretString>,
    pub asr_api_version: String,
    pub endpoints: Endpoints,
    pub limits: Limits,
    pub retry: RetryPolicy,
    pub threat_intel_interval: Duration,
    pub tenants: Vec<TenantRecord>,
}

impl Config {
    /// Defaults for the public cloud with no credentials configured.
    pub fn new() -> Result<Self> {
        Ok(Self {
            environment: Environment::Production,
            bind_addr: parse_addr(DEFAULT_BIND)?,
            home_tenant_id: None,
            identity: IdentityMode::ClientSecret,
            primary_app: None,
            backup_app: None,
            compliance_app_id: None,
            virustotal_api_key: None,
            asr_api_version: DEFAULT_ASR_API_VERSION.to_string(),
            endpoints: Endpoints::public_cloud()?,
            limits: Limits::default(),
            retry: RetryPolicy::default(),
            threat_intel_interval: Duration::from_secs(16),
            tenants: vec![],
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from environment-style key lookups; `lookup` returns `None`
    /// for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::new()?;

        if let Some(env) = get("TENANTLENS_ENV") {
            config.environment = env.parse()?;
        }
        if let Some(bind) = get("TENANTLENS_BIND") {
            config.bind_addr = parse_addr(&bind)?;
        }
        config.home_tenant_id = get("AZURE_TENANT_ID");
        config.primary_app = app_credentials(get("AZURE_CLIENT_ID"), get("AZURE_CLIENT_SECRET"));
        config.backup_app = app_credentials(get("BACKUP_APP_ID"), get("BACKUP_APP_SECRET"));
        config.compliance_app_id = get("COMPLIANCE_APP_ID");
        config.virustotal_api_key = get("VT_API_KEY").map(SecretString::from);
        if let Some(version) = get("ASR_API") {
            config.asr_api_version = version;
        }

        config.identity = match get("TENANTLENS_IDENTITY").as_deref() {
            None | Some("client_secret") => IdentityMode::ClientSecret,
            Some("managed") => {
                let endpoint = get("IDENTITY_ENDPOINT").ok_or_else(|| {
                    Error::Config("managed identity requires IDENTITY_ENDPOINT".into())
                })?;
                let header = get("IDENTITY_HEADER").ok_or_else(|| {
                    Error::Config("managed identity requires IDENTITY_HEADER".into())
                })?;
                IdentityMode::Managed {
                    endpoint: parse_url("IDENTITY_ENDPOINT", &endpoint)?,
                    header: SecretString::from(header),
                }
            }
            Some(other) => {
                return Err(Error::Config(format!(
                    "unknown identity mode: {other} (valid: client_secret, managed)"
                )));
            }
        };

        let endpoints = &mut config.endpoints;
        if let Some(url) = get("TENANTLENS_LOGIN_URL") {
            endpoints.login = parse_url("TENANTLENS_LOGIN_URL", &url)?;
        }
        if let Some(url) = get("TENANTLENS_GRAPH_URL") {
            endpoints.graph.base_url = parse_url("TENANTLENS_GRAPH_URL", &url)?;
        }
        if let Some(url) = get("TENANTLENS_MANAGEMENT_URL") {
            endpoints.management.base_url = parse_url("TENANTLENS_MANAGEMENT_URL", &url)?;
        }
        if let Some(url) = get("TENANTLENS_LOG_ANALYTICS_URL") {
            endpoints.log_analytics.base_url = parse_url("TENANTLENS_LOG_ANALYTICS_URL", &url)?;
        }
        if let Some(url) = get("TENANTLENS_VIRUSTOTAL_URL") {
            endpoints.threat_intel.base_url = parse_url("TENANTLENS_VIRUSTOTAL_URL", &url)?;
        }
        if let Some(url) = get("TENANTLENS_DIRECTORY_URL") {
            let resource = get("TENANTLENS_DIRECTORY_RESOURCE").unwrap_or_else(|| origin_of(&url));
            endpoints.directory = Some(ServiceEndpoint::new(&url, &resource)?);
        }

        if let Some(n) = parse_var::<usize>(&get, "TENANTLENS_MAX_PAGES")? {
            config.limits.max_pages = n;
        }
        if let Some(n) = parse_var::<usize>(&get, "TENANTLENS_MAX_CONCURRENCY")? {
            config.limits.max_concurrency = n;
        }
        if let Some(secs) = parse_var::<u64>(&get, "TENANTLENS_SCOPE_TIMEOUT_SECS")? {
            config.limits.scope_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&get, "TENANTLENS_REQUEST_TIMEOUT_SECS")? {
            config.limits.request_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>(&get, "TENANTLENS_VT_INTERVAL_MS")? {
            config.threat_intel_interval = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Environment first, then the YAML file at `path` (if any) on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Some(path) = path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    pub fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let o: ConfigOverride = serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(format!("parse config yaml: {e}")))?;

        if let Some(env) = o.environment {
            self.environment = env;
        }
        if let Some(bind) = o.bind_addr {
            self.bind_addr = parse_addr(&bind)?;
        }
        if o.home_tenant_id.is_some() {
            self.home_tenant_id = o.home_tenant_id;
        }
        if o.compliance_app_id.is_some() {
            self.compliance_app_id = o.compliance_app_id;
        }
        if let Some(version) = o.asr_api_version {
            self.asr_api_version = version;
        }

        let e = o.endpoints;
        if let Some(url) = e.login {
            self.endpoints.login = parse_url("endpoints.login", &url)?;
        }
        if let Some(url) = e.graph {
            self.endpoints.graph.base_url = parse_url("endpoints.graph", &url)?;
        }
        if let Some(url) = e.management {
            self.endpoints.management.base_url = parse_url("endpoints.management", &url)?;
        }
        if let Some(url) = e.log_analytics {
            self.endpoints.log_analytics.base_url = parse_url("endpoints.log_analytics", &url)?;
        }
        if let Some(url) = e.threat_intel {
            self.endpoints.threat_intel.base_url = parse_url("endpoints.threat_intel", &url)?;
        }
        if let Some(url) = e.directory {
            let resource = e.directory_resource.unwrap_or_else(|| origin_of(&url));
            self.endpoints.directory = Some(ServiceEndpoint::new(&url, &resource)?);
        }

        let l = o.limits;
        if let Some(n) = l.page_size {
            self.limits.page_size = n;
        }
        if let Some(n) = l.max_pages {
            self.limits.max_pages = n;
        }
        if let Some(n) = l.max_concurrency {
            self.limits.max_concurrency = n;
        }
        if let Some(secs) = l.scope_timeout_secs {
            self.limits.scope_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = l.request_timeout_secs {
            self.limits.request_timeout = Duration::from_secs(secs);
        }

        if let Some(n) = o.retry.max_retries {
            self.retry.max_retries = n;
        }
        if let Some(ms) = o.retry.base_delay_ms {
            self.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = o.threat_intel_interval_ms {
            self.threat_intel_interval = Duration::from_millis(ms);
        }
        if let Some(tenants) = o.tenants {
            self.tenants = tenants;
        }

        self.validate()
    }

    /// Diagnostic detail is only exposed outside production.
    pub fn expose_diagnostics(&self) -> bool {
        self.environment != Environment::Production
    }

    fn validate(&self) -> Result<()> {
        if self.limits.max_pages == 0 {
            return Err(Error::Config("max_pages must be > 0".into()));
        }
        if self.limits.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be > 0".into()));
        }
        if !(1..=999).contains(&self.limits.page_size) {
            return Err(Error::Config("page_size must be in 1..=999".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigOverride {
    environment: Option<Environment>,
    bind_addr: Option<String>,
    home_tenant_id: Option<String>,
    compliance_app_id: Option<String>,
    asr_api_version: Option<String>,
    endpoints: EndpointsOverride,
    limits: LimitsOverride,
    retry: RetryOverride,
    threat_intel_interval_ms: Option<u64>,
    tenants: Option<Vec<TenantRecord>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct EndpointsOverride {
    login: Option<String>,
    graph: Option<String>,
    management: Option<String>,
    log_analytics: Option<String>,
    directory: Option<String>,
    directory_resource: Option<String>,
    threat_intel: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LimitsOverride {
    page_size: Option<u32>,
    max_pages: Option<usize>,
    max_concurrency: Option<usize>,
    scope_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RetryOverride {
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
}

fn app_credentials(client_id: Option<String>, secret: Option<String>) -> Option<AppCredentials> {
    Some(AppCredentials {
        client_id: client_id?,
        client_secret: SecretString::from(secret?),
    })
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| Error::Config(format!("invalid value for {key}: {raw}")))
        })
        .transpose()
}

fn parse_url(what: &str, raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| Error::Config(format!("invalid {what} url {raw}: {e}")))
}

fn parse_addr(raw: &str) -> Result<SocketAddr> {
    raw.parse()
        .map_err(|e| Error::Config(format!("invalid bind address {raw}: {e}")))
}

fn origin_of(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.origin().ascii_serialization())
        .unwrap_or_else(|_| url.to_string())
}
