use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::aggregator::UseCase;
use crate::credential::Audience;
use crate::error::{Error, Result};
use crate::params::Params;
use crate::scope::{Scope, ScopeKind};
use crate::usecases::Services;

const QUERY_TIMESPAN: &str = "P30D";

/// Last boot (EventID 6005/6006) and last cumulative or security update
/// (EventID 19) per machine, full-outer-joined on lowercased name.
const REBOOT_PATCH_QUERY: &str = r#"
let boots = Event
    | where EventLog == "System" and EventID in (6005, 6006)
    | extend Host = tolower(Computer)
    | summarize LastReboot = max(TimeGenerated), BootName = any(Computer) by Host;
let patches = Event
    | where EventLog == "System" and EventID == 19
    | where not(RenderedDescription has "Defender" or RenderedDescription has "Security Intelligence Update" or RenderedDescription has ".NET Framework")
    | where (RenderedDescription has "Installation Successful: Windows successfully installed the following update" and RenderedDescription has "Cumulative") or RenderedDescription has "Security"
    | extend Host = tolower(Computer)
    | summarize arg_max(TimeGenerated, RenderedDescription, Computer) by Host
    | project Host, LastPatchTime = TimeGenerated, PatchDetails = RenderedDescription, PatchName = Computer;
boots
| join kind=fullouter patches on Host
| project
    Computer = coalesce(BootName, PatchName),
    LastReboot,
    LastPatchTime,
    PatchDetails = coalesce(PatchDetails, "No patch record found")
| order by Computer asc
"#;

#[derive(Debug, Serialize)]
struct QueryBody<'a> {
    query: &'a str,
    timespan: &'a str,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    tables: Vec<QueryTable>,
}

#[derive(Debug, Deserialize)]
struct QueryTable {
    columns: Vec<QueryColumn>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct QueryColumn {
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    pub computer: Option<String>,
    pub last_reboot: String,
    pub last_patch_time: String,
    pub patch_details: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    pub workspace_id: String,
    pub hosts: Vec<HostStatus>,
}

/// Reboot and patch recency per Log Analytics workspace.
pub struct RebootPatchStatus {
    services: Arc<Services>,
}

impl RebootPatchStatus {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl UseCase for RebootPatchStatus {
    type Output = WorkspaceStatus;

    fn name(&self) -> &'static str {
        "reboot-status"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["subscriptionId", "workspaceId"]
    }

    async fn scopes(&self, params: &Params) -> Result<Vec<Scope>> {
        self.services.primary()?;
        Ok(params
            .list("workspaceId")?
            .into_iter()
            .map(|id| Scope::new(ScopeKind::Workspace, id))
            .collect())
    }

    #[instrument(skip(self, _params), fields(scope = %scope))]
    async fn run_scope(&self, scope: Scope, _params: &Params) -> Result<WorkspaceStatus> {
        let credential = self
            .services
            .primary()?
            .resolve(&scope, Audience::LogAnalytics)
            .await?;

        let mut url = self.services.config.endpoints.log_analytics.url("workspaces")?;
        url.path_segments_mut()
            .map_err(|_| Error::Config("log analytics url cannot take a path".into()))?
            .push(&scope.id)
            .push("query");

        let body = QueryBody {
            query: REBOOT_PATCH_QUERY,
            timespan: QUERY_TIMESPAN,
        };
        let response: QueryResponse = self
            .services
            .client
            .post_json(&credential, "query workspace", &url, &body)
            .await?;

        let hosts = hosts_from(response)?;
        debug!(hosts = hosts.len(), "workspace query returned");
        Ok(WorkspaceStatus {
            workspace_id: scope.id,
            hosts,
        })
    }
}

fn hosts_from(response: QueryResponse) -> Result<Vec<HostStatus>> {
    let Some(table) = response.tables.into_iter().next() else {
        return Ok(vec![]);
    };
    let index: HashMap<&str, usize> = table
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.as_str(), i))
        .collect();
    let column = |name: &str| {
        index
            .get(name)
            .copied()
            .ok_or_else(|| Error::malformed("query workspace", format!("missing column '{name}'")))
    };
    let computer = column("Computer")?;
    let reboot = column("LastReboot")?;
    let patch = column("LastPatchTime")?;
    let details = column("PatchDetails")?;

    Ok(table
        .rows
        .iter()
        .map(|row| HostStatus {
            computer: cell_text(row.get(computer)),
            last_reboot: format_date(row.get(reboot)),
            last_patch_time: format_date(row.get(patch)),
            patch_details: cell_text(row.get(details)).unwrap_or_else(|| "N/A".to_string()),
        })
        .collect())
}

fn cell_text(cell: Option<&Value>) -> Option<String> {
    match cell? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// `YYYY-MM-DD`, `"Missing"` for null or empty, `"Invalid"` when unparsable.
fn format_date(cell: Option<&Value>) -> String {
    let Some(raw) = cell_text(cell).filter(|s| !s.trim().is_empty()) else {
        return "Missing".to_string();
    };
    let raw = raw.trim();
    let date = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.date()))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|dt| dt.date()))
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"));
    match date {
        Ok(date) => date.format("%Y-%m-%d").to_string(),
        Err(_) => "Invalid".to_string(),
    }
}
