use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::aggregator::UseCase;
use crate::credential::{Audience, Credential};
use crate::error::{Error, Result};
use crate::paging::collect_odata;
use crate::params::Params;
use crate::scope::{Scope, ScopeKind};
use crate::usecases::Services;

const SUBSCRIPTIONS_API_VERSION: &str = "2022-12-01";
const VAULTS_API_VERSION: &str = "2023-04-01";

#[derive(Debug, Deserialize)]
struct FriendlyProperties {
    #[serde(rename = "friendlyName")]
    friendly_name: Option<String>,
}

/// Fabric, protection container or protected item.
#[derive(Debug, Deserialize)]
struct ArmResource {
    name: String,
    properties: Option<FriendlyProperties>,
}

impl ArmResource {
    fn display_name(&self) -> String {
        self.properties
            .as_ref()
            .and_then(|p| p.friendly_name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.name.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Subscription {
    subscription_id: String,
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Vault {
    name: String,
    id: String,
    location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub name: String,
    pub id: String,
    pub replicated_item_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FabricSummary {
    pub name: String,
    pub id: String,
    pub protection_containers: Vec<ContainerSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultSummary {
    pub subscription_id: String,
    pub resource_group: String,
    pub vault_name: String,
    pub replicated_item_total: usize,
    pub fabrics: Vec<FabricSummary>,
    pub generated_at_utc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultEntry {
    pub name: String,
    pub resource_group: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionVaults {
    pub subscription_id: String,
    pub vaults: Vec<VaultEntry>,
}

/// ARM URL under the management endpoint with percent-encoded segments.
fn arm_url(services: &Services, segments: &[&str], api_version: &str) -> Result<Url> {
    let mut url = services.config.endpoints.management.base_url.clone();
    url.path_segments_mut()
        .map_err(|_| Error::Config("management url cannot take a path".into()))?
        .pop_if_empty()
        .extend(segments);
    url.query_pairs_mut().append_pair("api-version", api_version);
    Ok(url)
}

/// Resource group segment of an ARM resource id.
fn resource_group_of(id: &str) -> Option<String> {
    let mut segments = id.split('/');
    while let Some(segment) = segments.next() {
        if segment.eq_ignore_ascii_case("resourceGroups") {
            return segments.next().filter(|s| !s.is_empty()).map(str::to_string);
        }
    }
    None
}

/// Site Recovery replication summary for one vault.
pub struct RecoverySummary {
    services: Arc<Services>,
}

impl RecoverySummary {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn list(&self, credential: &Credential, operation: &str, segments: &[&str]) -> Result<Vec<ArmResource>> {
        let url = arm_url(&self.services, segments, &self.services.config.asr_api_version)?;
        collect_odata(
            &self.services.client,
            credential,
            operation,
            url,
            self.services.config.limits.max_pages,
        )
        .await
    }
}

#[async_trait]
impl UseCase for RecoverySummary {
    type Output = VaultSummary;

    fn name(&self) -> &'static str {
        "asr-summary"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["subId", "rg", "vault"]
    }

    async fn scopes(&self, params: &Params) -> Result<Vec<Scope>> {
        self.services.primary()?;
        let id = format!(
            "{}/{}/{}",
            params.require("subId")?,
            params.require("rg")?,
            params.require("vault")?
        );
        Ok(vec![Scope::named(ScopeKind::Vault, id, params.require("vault")?)])
    }

    #[instrument(skip(self, params), fields(scope = %scope))]
    async fn run_scope(&self, scope: Scope, params: &Params) -> Result<VaultSummary> {
        let subscription = params.require("subId")?;
        let resource_group = params.require("rg")?;
        let vault = params.require("vault")?;
        let credential = self
            .services
            .primary()?
            .resolve(&scope, Audience::Management)
            .await?;

        let vault_path = [
            "subscriptions",
            subscription,
            "resourceGroups",
            resource_group,
            "providers",
            "Microsoft.RecoveryServices",
            "vaults",
            vault,
        ];

        let mut total = 0usize;
        let mut fabrics = Vec::new();
        let fabric_path = [vault_path.as_slice(), &["replicationFabrics"]].concat();
        for fabric in self.list(&credential, "list fabrics", &fabric_path).await? {
            let container_path = [
                fabric_path.as_slice(),
                &[fabric.name.as_str(), "replicationProtectionContainers"],
            ]
            .concat();

            let mut containers = Vec::new();
            for container in self.list(&credential, "list protection containers", &container_path).await? {
                let items_path = [
                    container_path.as_slice(),
                    &[container.name.as_str(), "replicationProtectedItems"],
                ]
                .concat();
                let count = self.list(&credential, "list protected items", &items_path).await?.len();
                total += count;
                containers.push(ContainerSummary {
                    name: container.display_name(),
                    id: format!("/{}/{}", fabric.name, container.name),
                    replicated_item_count: count,
                });
            }

            fabrics.push(FabricSummary {
                name: fabric.display_name(),
                id: fabric.name.clone(),
                protection_containers: containers,
            });
        }
        debug!(fabrics = fabrics.len(), replicated = total, "vault walked");

        Ok(VaultSummary {
            subscription_id: subscription.to_string(),
            resource_group: resource_group.to_string(),
            vault_name: vault.to_string(),
            replicated_item_total: total,
            fabrics,
            generated_at_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }
}

/// Recovery Services vaults in every subscription the identity can see.
pub struct VaultInventory {
    services: Arc<Services>,
}

impl VaultInventory {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl UseCase for VaultInventory {
    type Output = SubscriptionVaults;

    fn name(&self) -> &'static str {
        "vaults"
    }

    async fn scopes(&self, _params: &Params) -> Result<Vec<Scope>> {
        let home = Scope::tenant(self.services.home_tenant()?);
        let credential = self
            .services
            .primary()?
            .resolve(&home, Audience::Management)
            .await?;
        let url = arm_url(&self.services, &["subscriptions"], SUBSCRIPTIONS_API_VERSION)?;
        let subscriptions: Vec<Subscription> = collect_odata(
            &self.services.client,
            &credential,
            "list subscriptions",
            url,
            self.services.config.limits.max_pages,
        )
        .await?;

        Ok(subscriptions
            .into_iter()
            .map(|s| match s.display_name {
                Some(name) => Scope::named(ScopeKind::Subscription, s.subscription_id, name),
                None => Scope::new(ScopeKind::Subscription, s.subscription_id),
            })
            .collect())
    }

    #[instrument(skip(self, _params), fields(scope = %scope))]
    async fn run_scope(&self, scope: Scope, _params: &Params) -> Result<SubscriptionVaults> {
        let credential = self
            .services
            .primary()?
            .resolve(&scope, Audience::Management)
            .await?;
        let url = arm_url(
            &self.services,
            &[
                "subscriptions",
                scope.id.as_str(),
                "providers",
                "Microsoft.RecoveryServices",
                "vaults",
            ],
            VAULTS_API_VERSION,
        )?;
        let vaults: Vec<Vault> = collect_odata(
            &self.services.client,
            &credential,
            "list vaults",
            url,
            self.services.config.limits.max_pages,
        )
        .await?;

        Ok(SubscriptionVaults {
            subscription_id: scope.id,
            vaults: vaults
                .into_iter()
                .map(|v| VaultEntry {
                    resource_group: resource_group_of(&v.id),
                    name: v.name,
                    location: v.location,
                })
                .collect(),
        })
    }
}
