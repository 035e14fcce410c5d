use std::sync::Arc;

use crate::client::{ApiClient, build_http};
use crate::config::{Config, IdentityMode};
use crate::credential::{ApiKeyResolver, ClientSecretResolver, CredentialResolver, ManagedIdentityResolver};
use crate::directory::{RestTenantDirectory, StaticTenantDirectory, TenantDirectory};
use crate::error::{Error, Result};
use crate::ratelimit::RateLimiter;

pub mod bookings;
pub mod compliance;
pub mod hashes;
pub mod licensing;
pub mod reboot;
pub mod recovery;
pub mod tenants;

pub use bookings::BookingsDirectory;
pub use compliance::TenantCompliance;
pub use hashes::HashCheck;
pub use licensing::LicensingReport;
pub use reboot::RebootPatchStatus;
pub use recovery::{RecoverySummary, VaultInventory};
pub use tenants::TenantListing;

/// Everything a use case reaches downstream through, built once from config.
pub struct Services {
    pub config: Arc<Config>,
    pub client: ApiClient,
    pub directory: Arc<dyn TenantDirectory>,
    pub threat_intel_limiter: Arc<RateLimiter>,
    primary: Option<Arc<dyn CredentialResolver>>,
    backup: Option<Arc<dyn CredentialResolver>>,
    threat_intel: Option<Arc<dyn CredentialResolver>>,
}

impl Services {
    pub fn from_config(config: Config) -> Result<Self> {
        let http = build_http(&config)?;
        let client = ApiClient::new(http.clone(), config.retry.clone());
        let primary = create_primary_resolver(&config, &http);
        let backup = create_backup_resolver(&config, &http);
        let threat_intel = config.virustotal_api_key.clone().map(|key| {
            Arc::new(ApiKeyResolver::new(config.endpoints.threat_intel.clone(), key))
                as Arc<dyn CredentialResolver>
        });
        let directory = create_directory(&config, &client, primary.clone())?;

        Ok(Self {
            threat_intel_limiter: Arc::new(RateLimiter::new(config.threat_intel_interval)),
            config: Arc::new(config),
            client,
            directory,
            primary,
            backup,
            threat_intel,
        })
    }

    pub fn with_directory(mut self, directory: Arc<dyn TenantDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn primary(&self) -> Result<&dyn CredentialResolver> {
        self.primary
            .as_deref()
            .ok_or_else(|| Error::Config("primary app credentials are not configured".into()))
    }

    pub fn backup(&self) -> Result<&dyn CredentialResolver> {
        self.backup
            .as_deref()
            .ok_or_else(|| Error::Config("backup app credentials are not configured".into()))
    }

    pub fn threat_intel(&self) -> Result<&dyn CredentialResolver> {
        self.threat_intel
            .as_deref()
            .ok_or_else(|| Error::Config("VT_API_KEY is not configured".into()))
    }

    pub fn home_tenant(&self) -> Result<&str> {
        self.config
            .home_tenant_id
            .as_deref()
            .ok_or_else(|| Error::Config("AZURE_TENANT_ID is not configured".into()))
    }
}

fn create_primary_resolver(config: &Config, http: &reqwest::Client) -> Option<Arc<dyn CredentialResolver>> {
    match &config.identity {
        IdentityMode::Managed { endpoint, header } => Some(Arc::new(ManagedIdentityResolver::new(
            http.clone(),
            config.endpoints.clone(),
            endpoint.clone(),
            header.clone(),
            config.home_tenant_id.clone(),
        )) as Arc<dyn CredentialResolver>),
        IdentityMode::ClientSecret => config.primary_app.clone().map(|app| {
            Arc::new(ClientSecretResolver::new(
                http.clone(),
                config.endpoints.clone(),
                app,
                config.home_tenant_id.clone(),
            )) as Arc<dyn CredentialResolver>
        }),
    }
}

fn create_backup_resolver(config: &Config, http: &reqwest::Client) -> Option<Arc<dyn CredentialResolver>> {
    config.backup_app.clone().map(|app| {
        Arc::new(ClientSecretResolver::new(
            http.clone(),
            config.endpoints.clone(),
            app,
            config.home_tenant_id.clone(),
        )) as Arc<dyn CredentialResolver>
    })
}

fn create_directory(
    config: &Config,
    client: &ApiClient,
    primary: Option<Arc<dyn CredentialResolver>>,
) -> Result<Arc<dyn TenantDirectory>> {
    match (&config.endpoints.directory, primary) {
        (Some(endpoint), Some(resolver)) => Ok(Arc::new(RestTenantDirectory::new(
            client.clone(),
            resolver,
            endpoint.clone(),
            config.limits.max_pages,
        )) as Arc<dyn TenantDirectory>),
        (Some(_), None) => Err(Error::Config(
            "tenant directory endpoint requires primary credentials".into(),
        )),
        (None, _) => Ok(Arc::new(StaticTenantDirectory::new(config.tenants.clone())) as Arc<dyn TenantDirectory>),
    }
}
