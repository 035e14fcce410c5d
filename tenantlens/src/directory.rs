use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::client::ApiClient;
use crate::config::ServiceEndpoint;
use crate::credential::{Audience, CredentialResolver};
use crate::error::{Error, Result};
use crate::paging::collect_odata;
use crate::scope::{Scope, ScopeKind};

/// One registered customer tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRecord {
    #[serde(alias = "TenantId")]
    pub tenant_id: String,
    #[serde(alias = "TenantName")]
    pub tenant_name: String,
}

impl TenantRecord {
    pub fn scope(&self) -> Scope {
        Scope::named(ScopeKind::Tenant, &self.tenant_id, &self.tenant_name)
    }
}

/// Consent and backup-app state last recorded for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComplianceState {
    pub is_active: bool,
    pub is_backup: bool,
}

/// The registry of managed tenants.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn list_tenants(&self) -> Result<Vec<TenantRecord>>;

    async fn record_compliance(&self, tenant_id: &str, state: ComplianceState) -> Result<()>;

    fn name(&self) -> &'static str;
}

pub fn registry_scope() -> Scope {
    Scope::new(ScopeKind::Directory, "registry")
}

/// Tenants listed in configuration. Compliance writes are kept in memory.
#[derive(Default)]
pub struct StaticTenantDirectory {
    tenants: Vec<TenantRecord>,
    recorded: Mutex<BTreeMap<String, ComplianceState>>,
}

impl StaticTenantDirectory {
    pub fn new(tenants: Vec<TenantRecord>) -> Self {
        Self {
            tenants,
            recorded: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn recorded(&self, tenant_id: &str) -> Option<ComplianceState> {
        self.recorded
            .lock()
            .ok()
            .and_then(|map| map.get(tenant_id).copied())
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn list_tenants(&self) -> Result<Vec<TenantRecord>> {
        Ok(self.tenants.clone())
    }

    async fn record_compliance(&self, tenant_id: &str, state: ComplianceState) -> Result<()> {
        if !self.tenants.iter().any(|t| t.tenant_id == tenant_id) {
            return Err(Error::fetch(
                "record compliance",
                format!("tenant {tenant_id} is not registered"),
            ));
        }
        let mut recorded = self
            .recorded
            .lock()
            .map_err(|_| Error::Internal("compliance store poisoned".into()))?;
        recorded.insert(tenant_id.to_string(), state);
        info!(tenant_id, is_active = state.is_active, is_backup = state.is_backup, "compliance recorded");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ComplianceUpdate {
    is_active: bool,
    is_backup: bool,
}

/// REST front of the tenant registry table (Data API builder style):
/// `GET {base}` pages rows via `nextLink`, `PATCH {base}/TenantId/{id}`
/// updates one row.
pub struct RestTenantDirectory {
    client: ApiClient,
    resolver: Arc<dyn CredentialResolver>,
    endpoint: ServiceEndpoint,
    max_pages: usize,
}

impl RestTenantDirectory {
    pub fn new(
        client: ApiClient,
        resolver: Arc<dyn CredentialResolver>,
        endpoint: ServiceEndpoint,
        max_pages: usize,
    ) -> Self {
        Self {
            client,
            resolver,
            endpoint,
            max_pages,
        }
    }
}

#[async_trait]
impl TenantDirectory for RestTenantDirectory {
    #[instrument(skip(self))]
    async fn list_tenants(&self) -> Result<Vec<TenantRecord>> {
        let credential = self.resolver.resolve(&registry_scope(), Audience::Directory).await?;
        let mut url = self.endpoint.base_url.clone();
        url.query_pairs_mut().append_pair("$select", "TenantId,TenantName");
        collect_odata(&self.client, &credential, "list tenants", url, self.max_pages).await
    }

    #[instrument(skip(self))]
    async fn record_compliance(&self, tenant_id: &str, state: ComplianceState) -> Result<()> {
        let credential = self.resolver.resolve(&registry_scope(), Audience::Directory).await?;
        let mut url = self.endpoint.url("TenantId")?;
        url.path_segments_mut()
            .map_err(|_| Error::Config("directory url cannot take a path".into()))?
            .push(tenant_id);
        let body = ComplianceUpdate {
            is_active: state.is_active,
            is_backup: state.is_backup,
        };
        self.client
            .patch_json(&credential, "record compliance", &url, &body)
            .await
    }

    fn name(&self) -> &'static str {
        "rest"
    }
}
