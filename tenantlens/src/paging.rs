use std::marker::PhantomData;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::client::ApiClient;
use crate::credential::Credential;
use crate::error::{Error, Result};

/// One page of a collection plus the continuation token, if any.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Send;

    /// Fetch the first page when `cursor` is `None`, otherwise the page the
    /// continuation token points at.
    async fn fetch(&self, cursor: Option<&str>) -> Result<Page<Self::Item>>;

    fn describe(&self) -> &str;
}

/// Follow continuation tokens until exhausted or `max_pages` pages have been
/// read. Items keep arrival order; any page failure fails the whole fetch.
pub async fn fetch_all<S>(source: &S, max_pages: usize) -> Result<Vec<S::Item>>
where
    S: PageSource + ?Sized,
{
    let max_pages = max_pages.max(1);
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = source.fetch(cursor.as_deref()).await?;
        pages += 1;
        debug!(source = source.describe(), page = pages, items = page.items.len(), "page fetched");
        items.extend(page.items);

        match page.next {
            None => break,
            Some(_) if pages >= max_pages => {
                warn!(
                    source = source.describe(),
                    max_pages,
                    items = items.len(),
                    "page cap reached, results truncated"
                );
                break;
            }
            Some(next) => cursor = Some(next),
        }
    }

    Ok(items)
}

/// Collection envelope shared by Graph, ARM and Data API builder.
#[derive(Debug, Deserialize)]
pub struct ODataPage<T> {
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink", alias = "nextLink", default)]
    pub next_link: Option<String>,
}

/// A `value` + `nextLink` collection behind an authenticated client.
pub struct ODataCollection<'a, T> {
    client: &'a ApiClient,
    credential: &'a Credential,
    operation: &'a str,
    first: Url,
    _item: PhantomData<fn() -> T>,
}

impl<'a, T> ODataCollection<'a, T> {
    pub fn new(client: &'a ApiClient, credential: &'a Credential, operation: &'a str, first: Url) -> Self {
        Self {
            client,
            credential,
            operation,
            first,
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<T> PageSource for ODataCollection<'_, T>
where
    T: DeserializeOwned + Send,
{
    type Item = T;

    async fn fetch(&self, cursor: Option<&str>) -> Result<Page<T>> {
        let url = match cursor {
            None => self.first.clone(),
            Some(link) => self
                .first
                .join(link)
                .map_err(|e| Error::malformed(self.operation, format!("invalid continuation link: {e}")))?,
        };
        let page: ODataPage<T> = self.client.get_json(self.credential, self.operation, &url).await?;
        Ok(Page {
            items: page.value,
            next: page.next_link.filter(|link| !link.is_empty()),
        })
    }

    fn describe(&self) -> &str {
        self.operation
    }
}

/// Fetch every page of an OData collection.
pub async fn collect_odata<T>(
    client: &ApiClient,
    credential: &Credential,
    operation: &str,
    first: Url,
    max_pages: usize,
) -> Result<Vec<T>>
where
    T: DeserializeOwned + Send,
{
    let source = ODataCollection::<T>::new(client, credential, operation, first);
    fetch_all(&source, max_pages).await
}
