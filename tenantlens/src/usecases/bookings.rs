use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::aggregator::UseCase;
use crate::credential::Audience;
use crate::error::Result;
use crate::paging::collect_odata;
use crate::params::Params;
use crate::scope::Scope;
use crate::usecases::Services;

const UNNAMED: &str = "Unnamed Booking Page";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookingBusiness {
    display_name: Option<String>,
    web_site_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingPage {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct BookingPages {
    pub pages: Vec<BookingPage>,
}

/// Public booking pages of the home tenant.
pub struct BookingsDirectory {
    services: Arc<Services>,
}

impl BookingsDirectory {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl UseCase for BookingsDirectory {
    type Output = BookingPages;

    fn name(&self) -> &'static str {
        "bookings"
    }

    async fn scopes(&self, _params: &Params) -> Result<Vec<Scope>> {
        self.services.primary()?;
        Ok(vec![Scope::tenant(self.services.home_tenant()?)])
    }

    #[instrument(skip(self, _params), fields(scope = %scope))]
    async fn run_scope(&self, scope: Scope, _params: &Params) -> Result<BookingPages> {
        let credential = self.services.primary()?.resolve(&scope, Audience::Graph).await?;
        let mut url = self.services.config.endpoints.graph.url("solutions/bookingBusinesses")?;
        url.query_pairs_mut()
            .append_pair("$select", "displayName,webSiteUrl")
            .append_pair("$top", "100");

        let businesses: Vec<BookingBusiness> = collect_odata(
            &self.services.client,
            &credential,
            "list booking businesses",
            url,
            self.services.config.limits.max_pages,
        )
        .await?;
        if businesses.is_empty() {
            warn!("no booking businesses returned");
        }

        Ok(BookingPages {
            pages: businesses.into_iter().filter_map(page_from).collect(),
        })
    }
}

fn page_from(business: BookingBusiness) -> Option<BookingPage> {
    let url = business.web_site_url.filter(|u| !u.trim().is_empty())?;
    let name = business
        .display_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| UNNAMED.to_string());
    Some(BookingPage { name, url })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use crate::params::Request;
    use crate::usecases::testing::{config_for, mount_tokens};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn blank_name_reads_as_unnamed() {
        let page = page_from(BookingBusiness {
            display_name: Some("   ".into()),
            web_site_url: Some("https://book.example/blank".into()),
        });
        assert_eq!(page.map(|p| p.name), Some(UNNAMED.to_string()));
    }

    #[tokio::test]
    async fn lists_pages_with_urls() {
        let server = MockServer::start().await;
        mount_tokens(&server).await;
        Mock::given(method("GET"))
            .and(path("/graph/v1.0/solutions/bookingBusinesses"))
            .and(query_param("$top", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {"displayName": "Support", "webSiteUrl": "https://book.example/support"},
                    {"displayName": "Draft", "webSiteUrl": ""},
                    {"webSiteUrl": "https://book.example/anon"}
                ],
                "@odata.nextLink": "/graph/v1.0/solutions/bookingBusinesses?$skiptoken=2"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph/v1.0/solutions/bookingBusinesses"))
            .and(query_param("$skiptoken", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"displayName": "Sales", "webSiteUrl": "https://book.example/sales"}]
            })))
            .mount(&server)
            .await;

        let config = config_for(&server);
        let aggregator = Aggregator::new(&config);
        let services = Arc::new(Services::from_config(config).unwrap());

        let collected = aggregator
            .aggregate(&BookingsDirectory::new(services), &Request::default())
            .await
            .unwrap();
        assert!(collected.failures.is_empty());
        assert_eq!(
            collected.results[0].pages,
            vec![
                BookingPage {
                    name: "Support".into(),
                    url: "https://book.example/support".into()
                },
                BookingPage {
                    name: UNNAMED.into(),
                    url: "https://book.example/anon".into()
                },
                BookingPage {
                    name: "Sales".into(),
                    url: "https://book.example/sales".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn missing_home_tenant_is_config_error() {
        let server = MockServer::start().await;
        let mut config = config_for(&server);
        config.home_tenant_id = None;
        let aggregator = Aggregator::new(&config);
        let services = Arc::new(Services::from_config(config).unwrap());

        let err = aggregator
            .aggregate(&BookingsDirectory::new(services), &Request::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}
