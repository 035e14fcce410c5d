use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::aggregator::UseCase;
use crate::credential::{Audience, Credential};
use crate::enrich::{Enrich, LookupTable, Misses, merge};
use crate::error::{Error, Result};
use crate::paging::collect_odata;
use crate::params::Params;
use crate::scope::Scope;
use crate::usecases::Services;

const USER_FIELDS: &str = "displayName,userPrincipalName,assignedLicenses,signInActivity,accountEnabled,mobilePhone,businessPhones,onPremisesSyncEnabled";
const MAILBOX_REPORT: &str = "reports/getMailboxUsageDetail(period='D7')";
const UPN_COLUMN: &str = "User Principal Name";
const STORAGE_COLUMN: &str = "Storage Used (Byte)";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribedSku {
    sku_id: Option<String>,
    sku_part_number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignedLicense {
    sku_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInActivity {
    last_sign_in_date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    display_name: Option<String>,
    user_principal_name: Option<String>,
    assigned_licenses: Option<Vec<AssignedLicense>>,
    sign_in_activity: Option<SignInActivity>,
    account_enabled: Option<bool>,
    mobile_phone: Option<String>,
    business_phones: Option<Vec<String>>,
    on_premises_sync_enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicensedUser {
    pub display_name: Option<String>,
    pub user_principal_name: Option<String>,
    pub licenses: Vec<String>,
    pub last_sign_in_date: Option<String>,
    pub sign_in_status: &'static str,
    pub mobile_phone: Option<String>,
    pub business_phones: Option<String>,
    #[serde(rename = "isSyncedFromAD")]
    pub is_synced_from_ad: &'static str,
    #[serde(rename = "mailboxSizeMB")]
    pub mailbox_size_mb: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantLicensing {
    pub tenant_id: String,
    pub users: Vec<LicensedUser>,
}

pub fn unmapped_sku(id: &str) -> String {
    format!("Unmapped SKU: {id}")
}

/// Per-tenant user licensing, sign-in and mailbox size report.
pub struct LicensingReport {
    services: Arc<Services>,
}

impl LicensingReport {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn sku_table(&self, credential: &Credential) -> Result<LookupTable<String>> {
        let graph = &self.services.config.endpoints.graph;
        let skus: Vec<SubscribedSku> = collect_odata(
            &self.services.client,
            credential,
            "list subscribed skus",
            graph.url("subscribedSkus")?,
            self.services.config.limits.max_pages,
        )
        .await?;

        let mut table = LookupTable::new("sku");
        for sku in skus {
            if let Some(id) = sku.sku_id {
                let name = sku.sku_part_number.unwrap_or_else(|| unmapped_sku(&id));
                table.insert(&id, name);
            }
        }
        Ok(table)
    }

    async fn users(&self, credential: &Credential) -> Result<Vec<GraphUser>> {
        let limits = &self.services.config.limits;
        let mut url = self.services.config.endpoints.graph.url("users")?;
        url.query_pairs_mut()
            .append_pair("$select", USER_FIELDS)
            .append_pair("$top", &limits.page_size.to_string());
        collect_odata(&self.services.client, credential, "list users", url, limits.max_pages).await
    }

    /// The report is best effort: any failure leaves mailbox sizes empty.
    async fn mailbox_table(&self, scope: &Scope, credential: &Credential) -> LookupTable<u64> {
        let fetched = match self.services.config.endpoints.graph.url(MAILBOX_REPORT) {
            Ok(url) => {
                self.services
                    .client
                    .get_text(credential, "mailbox usage report", &url)
                    .await
            }
            Err(e) => Err(e),
        };
        match fetched.and_then(|csv| parse_mailbox_usage(&csv)) {
            Ok(table) => {
                debug!(%scope, mailboxes = table.len(), "mailbox usage mapped");
                table
            }
            Err(e) => {
                warn!(%scope, kind = e.kind(), error = %e, "mailbox usage report unavailable");
                LookupTable::case_insensitive("mailbox")
            }
        }
    }
}

#[async_trait]
impl UseCase for LicensingReport {
    type Output = TenantLicensing;

    fn name(&self) -> &'static str {
        "licensing"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["tenantId"]
    }

    async fn scopes(&self, params: &Params) -> Result<Vec<Scope>> {
        self.services.primary()?;
        Ok(params.list("tenantId")?.into_iter().map(Scope::tenant).collect())
    }

    #[instrument(skip(self, _params), fields(scope = %scope))]
    async fn run_scope(&self, scope: Scope, _params: &Params) -> Result<TenantLicensing> {
        let credential = self.services.primary()?.resolve(&scope, Audience::Graph).await?;

        let skus = self.sku_table(&credential).await?;
        let users = self.users(&credential).await?;
        debug!(users = users.len(), skus = skus.len(), "directory fetched");
        let mailboxes = self.mailbox_table(&scope, &credential).await;

        let users = merge(
            users,
            &UserEnricher {
                skus: &skus,
                mailboxes: &mailboxes,
            },
        );
        Ok(TenantLicensing {
            tenant_id: scope.id,
            users,
        })
    }
}

struct UserEnricher<'a> {
    skus: &'a LookupTable<String>,
    mailboxes: &'a LookupTable<u64>,
}

impl Enrich<GraphUser> for UserEnricher<'_> {
    type Output = LicensedUser;

    fn enrich(&self, user: GraphUser, misses: &mut Misses) -> LicensedUser {
        let licenses = match user.assigned_licenses {
            None => vec!["None".to_string()],
            Some(assigned) => assigned
                .into_iter()
                .map(|license| {
                    let id = license.sku_id.unwrap_or_default();
                    self.skus
                        .resolve(&id, misses)
                        .cloned()
                        .unwrap_or_else(|| unmapped_sku(&id))
                })
                .collect(),
        };

        let mailbox_size_mb = user
            .user_principal_name
            .as_deref()
            .and_then(|upn| self.mailboxes.resolve(upn, misses))
            .map(|bytes| bytes_to_mb(*bytes));

        LicensedUser {
            display_name: user.display_name,
            user_principal_name: user.user_principal_name,
            licenses,
            last_sign_in_date: user.sign_in_activity.and_then(|a| a.last_sign_in_date_time),
            sign_in_status: if user.account_enabled == Some(true) {
                "Enabled"
            } else {
                "Disabled"
            },
            mobile_phone: user.mobile_phone,
            business_phones: user.business_phones.map(|phones| phones.join(", ")),
            is_synced_from_ad: if user.on_premises_sync_enabled == Some(true) {
                "AD Synced"
            } else {
                "Cloud Only"
            },
            mailbox_size_mb,
        }
    }
}

/// Megabytes to one decimal, half-to-even.
fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB * 10.0).round_ties_even() / 10.0
}

/// UPN to storage bytes from the mailbox usage CSV. Rows without a UPN or
/// with a non-numeric size are skipped.
fn parse_mailbox_usage(csv_text: &str) -> Result<LookupTable<u64>> {
    let csv_text = csv_text.trim_start_matches('\u{feff}');
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| Error::malformed("mailbox usage report", e.to_string()))?
        .clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| Error::malformed("mailbox usage report", format!("missing column '{name}'")))
    };
    let upn_index = column(UPN_COLUMN)?;
    let storage_index = column(STORAGE_COLUMN)?;

    let mut table = LookupTable::case_insensitive("mailbox");
    for record in reader.records() {
        let record = record.map_err(|e| Error::malformed("mailbox usage report", e.to_string()))?;
        let upn = record.get(upn_index).map(str::trim).unwrap_or_default();
        let bytes = record
            .get(storage_index)
            .and_then(|raw| raw.trim().parse::<u64>().ok());
        match bytes {
            Some(bytes) if !upn.is_empty() => table.replace(upn, bytes),
            _ => debug!(upn, "mailbox usage row skipped"),
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\u{feff}Report Refresh Date,User Principal Name,Display Name,Storage Used (Byte),Report Period\n\
        2025-01-01,Alice@Contoso.com,Alice,52428800,7\n\
        2025-01-01,bob@contoso.com,Bob,,7\n\
        2025-01-01,,Ghost,1024,7\n";

    fn user(upn: &str, licenses: Option<Vec<&str>>) -> GraphUser {
        GraphUser {
            display_name: Some(upn.to_string()),
            user_principal_name: Some(upn.to_string()),
            assigned_licenses: licenses.map(|ids| {
                ids.into_iter()
                    .map(|id| AssignedLicense {
                        sku_id: Some(id.to_string()),
                    })
                    .collect()
            }),
            sign_in_activity: None,
            account_enabled: Some(true),
            mobile_phone: None,
            business_phones: Some(vec!["+1 555 0100".into(), "+1 555 0101".into()]),
            on_premises_sync_enabled: None,
        }
    }

    #[test]
    fn parses_mailbox_report_case_insensitively() {
        let table = parse_mailbox_usage(REPORT).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("alice@contoso.com"), Some(&52428800));
        assert!(table.get("bob@contoso.com").is_none());
    }

    #[test]
    fn later_mailbox_row_overrides_earlier() {
        let report = "User Principal Name,Storage Used (Byte)\n\
            alice@contoso.com,1024\n\
            ALICE@contoso.com,2048\n";
        let table = parse_mailbox_usage(report).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("Alice@Contoso.com"), Some(&2048));
    }

    #[test]
    fn report_without_storage_column_is_malformed() {
        let err = parse_mailbox_usage("User Principal Name,Other\na@b.c,1\n").unwrap_err();
        assert_eq!(err.kind(), "malformed");
    }

    #[test]
    fn rounds_to_one_decimal() {
        assert_eq!(bytes_to_mb(52428800), 50.0);
        assert_eq!(bytes_to_mb(1572864), 1.5);
        assert_eq!(bytes_to_mb(1100000), 1.0);
        assert_eq!(bytes_to_mb(0), 0.0);
    }

    #[test]
    fn enrichment_uses_fallbacks() {
        let mut skus = LookupTable::new("sku");
        skus.insert("sku-1", "ENTERPRISEPACK".to_string());
        let mailboxes = parse_mailbox_usage(REPORT).unwrap();
        let enricher = UserEnricher {
            skus: &skus,
            mailboxes: &mailboxes,
        };

        let merged = merge(
            vec![
                user("alice@contoso.com", Some(vec!["sku-1", "sku-9"])),
                user("carol@contoso.com", None),
                user("dave@contoso.com", Some(vec![])),
            ],
            &enricher,
        );

        assert_eq!(merged[0].licenses, vec!["ENTERPRISEPACK", "Unmapped SKU: sku-9"]);
        assert_eq!(merged[0].mailbox_size_mb, Some(50.0));
        assert_eq!(merged[0].business_phones.as_deref(), Some("+1 555 0100, +1 555 0101"));
        assert_eq!(merged[0].sign_in_status, "Enabled");
        assert_eq!(merged[0].is_synced_from_ad, "Cloud Only");

        assert_eq!(merged[1].licenses, vec!["None"]);
        assert_eq!(merged[1].mailbox_size_mb, None);
        assert!(merged[2].licenses.is_empty());
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let mut skus = LookupTable::new("sku");
        skus.insert("sku-1", "E5".to_string());
        let mailboxes = LookupTable::case_insensitive("mailbox");
        let merged = merge(
            vec![user("a@b.c", Some(vec!["sku-1"]))],
            &UserEnricher {
                skus: &skus,
                mailboxes: &mailboxes,
            },
        );
        let json = serde_json::to_value(&merged[0]).unwrap();
        assert_eq!(json["isSyncedFromAD"], "Cloud Only");
        assert_eq!(json["mailboxSizeMB"], serde_json::Value::Null);
        assert_eq!(json["userPrincipalName"], "a@b.c");
    }
}
