use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::aggregator::UseCase;
use crate::credential::Audience;
use crate::error::{Error, Result};
use crate::params::Params;
use crate::scope::{Scope, ScopeKind};
use crate::usecases::Services;

const UNKNOWN_PATH: &str = "(unknown)";

/// One row of the uploaded inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashEntry {
    pub hash: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HashStatus {
    Found,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashVerdict {
    pub path: String,
    pub hash: String,
    pub status: HashStatus,
    pub malicious: u64,
    pub suspicious: u64,
    pub undetected: u64,
}

#[derive(Debug, Default, Deserialize)]
struct AnalysisStats {
    #[serde(default)]
    malicious: u64,
    #[serde(default)]
    suspicious: u64,
    #[serde(default)]
    undetected: u64,
}

#[derive(Debug, Deserialize)]
struct FileAttributes {
    #[serde(default)]
    last_analysis_stats: AnalysisStats,
}

#[derive(Debug, Deserialize)]
struct FileData {
    attributes: FileAttributes,
}

#[derive(Debug, Deserialize)]
struct FileReport {
    data: FileData,
}

/// Parse a hash inventory: header row, hash in the second column, path in
/// the third. Short rows, blank hashes and repeated headers are skipped.
pub fn parse_hash_csv(body: &str) -> Vec<HashEntry> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let mut entries = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "skipping unreadable row");
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        if record.len() < 2 {
            warn!(line, "skipping row: not enough columns");
            continue;
        }
        let hash = record.get(1).unwrap_or_default();
        if hash.is_empty() || hash == "Hash" {
            warn!(line, "skipping row: hash missing or header row");
            continue;
        }
        let path = record
            .get(2)
            .filter(|p| !p.is_empty())
            .unwrap_or(UNKNOWN_PATH);
        entries.push(HashEntry {
            hash: hash.to_string(),
            path: path.to_string(),
        });
    }
    entries
}

/// Looks up every file hash in an uploaded CSV against the
/// threat-intelligence service, one at a time.
pub struct HashCheck {
    services: Arc<Services>,
}

impl HashCheck {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl UseCase for HashCheck {
    type Output = HashVerdict;

    fn name(&self) -> &'static str {
        "hashes"
    }

    fn max_concurrency(&self) -> Option<usize> {
        Some(1)
    }

    async fn scopes(&self, params: &Params) -> Result<Vec<Scope>> {
        let body = params
            .body()
            .ok_or_else(|| Error::MissingParameter("body".into()))?;
        self.services.threat_intel()?;
        let entries = parse_hash_csv(body);
        debug!(hashes = entries.len(), "parsed hash inventory");
        Ok(entries
            .into_iter()
            .map(|e| Scope::named(ScopeKind::Hash, e.hash, e.path))
            .collect())
    }

    #[instrument(skip(self, _params), fields(scope = %scope))]
    async fn run_scope(&self, scope: Scope, _params: &Params) -> Result<HashVerdict> {
        let credential = self
            .services
            .threat_intel()?
            .resolve(&scope, Audience::ThreatIntel)
            .await?;

        let mut url = self.services.config.endpoints.threat_intel.url("files")?;
        url.path_segments_mut()
            .map_err(|_| Error::Config("threat intel url cannot take a path".into()))?
            .push(&scope.id);

        self.services.threat_intel_limiter.acquire().await;
        let report: Option<FileReport> = self
            .services
            .client
            .get_optional_json(&credential, "look up file hash", &url)
            .await?;

        let path = scope.label().to_string();
        let verdict = match report {
            Some(report) => {
                let stats = report.data.attributes.last_analysis_stats;
                HashVerdict {
                    path,
                    hash: scope.id,
                    status: HashStatus::Found,
                    malicious: stats.malicious,
                    suspicious: stats.suspicious,
                    undetected: stats.undetected,
                }
            }
            None => HashVerdict {
                path,
                hash: scope.id,
                status: HashStatus::NotFound,
                malicious: 0,
                suspicious: 0,
                undetected: 0,
            },
        };
        Ok(verdict)
    }
}
