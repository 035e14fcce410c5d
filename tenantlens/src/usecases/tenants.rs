use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::aggregator::UseCase;
use crate::directory::{TenantRecord, registry_scope};
use crate::error::Result;
use crate::params::Params;
use crate::scope::Scope;
use crate::usecases::Services;

#[derive(Debug, Serialize)]
pub struct TenantList {
    pub tenants: Vec<TenantRecord>,
}

/// Every tenant in the registry.
pub struct TenantListing {
    services: Arc<Services>,
}

impl TenantListing {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl UseCase for TenantListing {
    type Output = TenantList;

    fn name(&self) -> &'static str {
        "tenants"
    }

    async fn scopes(&self, _params: &Params) -> Result<Vec<Scope>> {
        Ok(vec![registry_scope()])
    }

    async fn run_scope(&self, _scope: Scope, _params: &Params) -> Result<TenantList> {
        let tenants = self.services.directory.list_tenants().await?;
        Ok(TenantList { tenants })
    }
}
