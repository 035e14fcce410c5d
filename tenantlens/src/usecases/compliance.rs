use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::IgnoredAny;
use tracing::{info, instrument, warn};

use crate::aggregator::UseCase;
use crate::credential::{Audience, Credential, CredentialResolver};
use crate::directory::ComplianceState;
use crate::error::{Error, Result};
use crate::paging::ODataPage;
use crate::params::Params;
use crate::scope::Scope;
use crate::usecases::Services;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantComplianceResult {
    pub tenant_id: String,
    pub tenant_name: String,
    pub compliant: bool,
    pub backup: bool,
}

/// Checks consent for the monitored app and the backup app in every
/// registered tenant, then writes the outcome back to the registry.
pub struct TenantCompliance {
    services: Arc<Services>,
}

impl TenantCompliance {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    fn compliance_app_id(&self) -> Result<&str> {
        self.services
            .config
            .compliance_app_id
            .as_deref()
            .ok_or_else(|| Error::Config("COMPLIANCE_APP_ID is not configured".into()))
    }

    fn backup_app_id(&self) -> Result<&str> {
        self.services
            .config
            .backup_app
            .as_ref()
            .map(|app| app.client_id.as_str())
            .ok_or_else(|| Error::Config("backup app credentials are not configured".into()))
    }

    async fn service_principal_exists(&self, credential: &Credential, app_id: &str) -> Result<bool> {
        let mut url = self.services.config.endpoints.graph.url("servicePrincipals")?;
        url.query_pairs_mut()
            .append_pair("$filter", &format!("appId eq '{}'", app_id.replace('\'', "''")))
            .append_pair("$select", "id");
        let page: ODataPage<IgnoredAny> = self
            .services
            .client
            .get_json(credential, "find service principal", &url)
            .await?;
        Ok(!page.value.is_empty())
    }

    /// Whether `app_id` has a service principal in the tenant, seen through
    /// `resolver`. A refused grant means the app is not there.
    async fn consented(&self, scope: &Scope, resolver: &dyn CredentialResolver, app_id: &str) -> Result<bool> {
        let credential = match resolver.resolve(scope, Audience::Graph).await {
            Ok(credential) => credential,
            Err(e) if e.is_grant_refused() => {
                warn!(%scope, app_id, error = %e, "app not consented in tenant");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        self.service_principal_exists(&credential, app_id).await
    }
}

#[async_trait]
impl UseCase for TenantCompliance {
    type Output = TenantComplianceResult;

    fn name(&self) -> &'static str {
        "compliance"
    }

    async fn scopes(&self, _params: &Params) -> Result<Vec<Scope>> {
        self.services.primary()?;
        self.services.backup()?;
        self.compliance_app_id()?;
        self.backup_app_id()?;
        let tenants = self.services.directory.list_tenants().await?;
        Ok(tenants.iter().map(|t| t.scope()).collect())
    }

    #[instrument(skip(self, _params), fields(scope = %scope))]
    async fn run_scope(&self, scope: Scope, _params: &Params) -> Result<TenantComplianceResult> {
        let compliant = self
            .consented(&scope, self.services.primary()?, self.compliance_app_id()?)
            .await?;
        let backup = self
            .consented(&scope, self.services.backup()?, self.backup_app_id()?)
            .await?;

        self.services
            .directory
            .record_compliance(
                &scope.id,
                ComplianceState {
                    is_active: compliant,
                    is_backup: backup,
                },
            )
            .await?;
        info!(tenant = scope.label(), compliant, backup, "tenant compliance checked");

        Ok(TenantComplianceResult {
            tenant_name: scope.label().to_string(),
            tenant_id: scope.id,
            compliant,
            backup,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use crate::directory::{StaticTenantDirectory, TenantRecord};
    use crate::params::Request;
    use crate::usecases::testing::{config_for, mount_tokens};
    use reqwest::StatusCode;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tenant(id: &str, name: &str) -> TenantRecord {
        TenantRecord {
            tenant_id: id.to_string(),
            tenant_name: name.to_string(),
        }
    }

    async fn mount_principals(server: &MockServer, app_id: &str, found: bool) {
        let value = if found {
            serde_json::json!([{"id": "sp-1"}])
        } else {
            serde_json::json!([])
        };
        Mock::given(method("GET"))
            .and(path("/graph/v1.0/servicePrincipals"))
            .and(query_param("$filter", format!("appId eq '{app_id}'")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "value": value })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn records_consent_and_backup_state() {
        let server = MockServer::start().await;
        mount_tokens(&server).await;
        mount_principals(&server, "compliance-app", true).await;
        mount_principals(&server, "backup-app", false).await;

        let config = config_for(&server);
        let aggregator = Aggregator::new(&config);
        let directory = Arc::new(StaticTenantDirectory::new(vec![tenant("t1", "Contoso")]));
        let services = Arc::new(Services::from_config(config).unwrap().with_directory(directory.clone()));

        let collected = aggregator
            .aggregate(&TenantCompliance::new(services), &Request::default())
            .await
            .unwrap();

        assert_eq!(
            collected.results,
            vec![TenantComplianceResult {
                tenant_id: "t1".into(),
                tenant_name: "Contoso".into(),
                compliant: true,
                backup: false,
            }]
        );
        assert_eq!(
            directory.recorded("t1"),
            Some(ComplianceState {
                is_active: true,
                is_backup: false
            })
        );
    }

    #[tokio::test]
    async fn denied_tenant_fails_only_its_scope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/bad/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_request"
            })))
            .mount(&server)
            .await;
        mount_tokens(&server).await;
        mount_principals(&server, "compliance-app", true).await;
        mount_principals(&server, "backup-app", true).await;

        let config = config_for(&server);
        let aggregator = Aggregator::new(&config);
        let directory = Arc::new(StaticTenantDirectory::new(vec![
            tenant("good", "Good"),
            tenant("bad", "Bad"),
        ]));
        let services = Arc::new(Services::from_config(config).unwrap().with_directory(directory.clone()));

        let payload = aggregator
            .handle(&TenantCompliance::new(services), &Request::default())
            .await;
        assert_eq!(payload.status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&payload.body).unwrap();
        assert_eq!(json["results"].as_array().unwrap().len(), 1);
        assert_eq!(json["failures"][0]["scope"], "tenant:bad");
        assert_eq!(json["failures"][0]["kind"], "auth");
        assert!(directory.recorded("bad").is_none());
    }

    #[tokio::test]
    async fn refused_backup_grant_records_no_backup() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/t1/oauth2/v2.0/token"))
            .and(body_string_contains("client_id=backup-app"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "unauthorized_client",
                "error_description": "AADSTS700016: Application not found in the directory."
            })))
            .mount(&server)
            .await;
        mount_tokens(&server).await;
        mount_principals(&server, "compliance-app", true).await;

        let config = config_for(&server);
        let aggregator = Aggregator::new(&config);
        let directory = Arc::new(StaticTenantDirectory::new(vec![tenant("t1", "Contoso")]));
        let services = Arc::new(Services::from_config(config).unwrap().with_directory(directory.clone()));

        let payload = aggregator
            .handle(&TenantCompliance::new(services), &Request::default())
            .await;
        assert_eq!(payload.status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&payload.body).unwrap();
        assert_eq!(json["failures"], serde_json::json!([]));
        assert_eq!(json["results"][0]["compliant"], true);
        assert_eq!(json["results"][0]["backup"], false);
        assert_eq!(
            directory.recorded("t1"),
            Some(ComplianceState {
                is_active: true,
                is_backup: false
            })
        );
    }

    #[tokio::test]
    async fn refused_primary_grant_still_checks_backup() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/t1/oauth2/v2.0/token"))
            .and(body_string_contains("client_id=primary-app"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": "invalid_client"
            })))
            .mount(&server)
            .await;
        mount_tokens(&server).await;
        mount_principals(&server, "backup-app", true).await;

        let config = config_for(&server);
        let aggregator = Aggregator::new(&config);
        let directory = Arc::new(StaticTenantDirectory::new(vec![tenant("t1", "Contoso")]));
        let services = Arc::new(Services::from_config(config).unwrap().with_directory(directory.clone()));

        let collected = aggregator
            .aggregate(&TenantCompliance::new(services), &Request::default())
            .await
            .unwrap();
        assert!(collected.failures.is_empty());
        assert_eq!(
            directory.recorded("t1"),
            Some(ComplianceState {
                is_active: false,
                is_backup: true
            })
        );
    }

    #[tokio::test]
    async fn failed_write_back_fails_the_tenant() {
        let server = MockServer::start().await;
        mount_tokens(&server).await;
        mount_principals(&server, "compliance-app", true).await;
        mount_principals(&server, "backup-app", true).await;

        // Registry does not know t2, so the write-back errors.
        let directory = Arc::new(StaticTenantDirectory::new(vec![tenant("t1", "Contoso")]));
        let services = Arc::new(
            Services::from_config(config_for(&server))
                .unwrap()
                .with_directory(directory.clone()),
        );
        let use_case = TenantCompliance::new(services);

        let err = use_case
            .run_scope(Scope::tenant("t2"), &Params::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "fetch");
        assert!(directory.recorded("t2").is_none());
    }

    #[tokio::test]
    async fn missing_compliance_app_is_config_error() {
        let server = MockServer::start().await;
        let mut config = config_for(&server);
        config.compliance_app_id = None;
        let aggregator = Aggregator::new(&config);
        let services = Arc::new(Services::from_config(config).unwrap());

        let err = aggregator
            .aggregate(&TenantCompliance::new(services), &Request::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}
