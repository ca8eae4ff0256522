//! Context store contract, the HTTP Orion client, and paginated collection reads.

pub mod memory;

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use evac_core::{Entity, EvacuationSpaceAttrs};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

pub use memory::{MemoryContextStore, StoreCall};

pub const CRATE_NAME: &str = "evac-storage";

pub const HEADER_SERVICE: &str = "Fiware-Service";
pub const HEADER_SERVICE_PATH: &str = "Fiware-ServicePath";

pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Failure kinds of a context store call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no response received from server: {message}")]
    TransportUnreachable { message: String },
    #[error("http status {status}: {body}")]
    RemoteStatus { status: u16, body: String },
    #[error("{message}")]
    Other { message: String },
}

impl StoreError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

/// Send and body-read failures. A body cut short (stall past the timeout, dropped
/// connection) counts as no response; JSON decoding is handled by the caller.
pub fn classify_reqwest_error(err: &reqwest::Error) -> StoreError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        StoreError::TransportUnreachable {
            message: err.to_string(),
        }
    } else {
        StoreError::other(err.to_string())
    }
}

/// Result of an existence check. Anything other than found / 404 is a `StoreError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub description: String,
    pub subject: SubscriptionSubject,
    pub notification: SubscriptionNotification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSubject {
    pub entities: Vec<EntitySelector>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySelector {
    pub id_pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionNotification {
    pub http: HttpEndpoint,
    pub metadata: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpEndpoint {
    pub url: String,
}

#[async_trait]
pub trait ContextStore: Send + Sync {
    /// One page of a typed collection.
    async fn list_entities(
        &self,
        entity_type: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JsonValue>, StoreError>;

    async fn lookup_entity(&self, id: &str) -> Result<Lookup, StoreError>;

    async fn update_attrs(
        &self,
        id: &str,
        entity_type: &str,
        attrs: &EvacuationSpaceAttrs,
    ) -> Result<(), StoreError>;

    async fn create_entity(&self, entity: &Entity) -> Result<(), StoreError>;

    /// Returns the `Location` of the new subscription when the store reports one.
    async fn create_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Option<String>, StoreError>;
}

/// Reads a whole typed collection page by page until a short page comes back.
#[derive(Debug, Clone)]
pub struct PaginatedFetcher {
    entity_type: String,
    page_size: usize,
}

impl PaginatedFetcher {
    pub fn new(entity_type: impl Into<String>, page_size: usize) -> Self {
        Self {
            entity_type: entity_type.into(),
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// All records of the collection, or the first page failure. Never partial.
    pub async fn fetch_all<S>(&self, store: &S) -> Result<Vec<JsonValue>, StoreError>
    where
        S: ContextStore + ?Sized,
    {
        let limit = self.page_size;
        let mut offset = 0usize;
        let mut all = Vec::new();

        loop {
            let page = store
                .list_entities(&self.entity_type, limit, offset)
                .await?;
            debug!(offset, limit, returned = page.len(), "fetched page");
            let exhausted = page.len() < limit;
            all.extend(page);
            if exhausted {
                break;
            }
            offset += limit;
        }

        info!(entity_type = %self.entity_type, count = all.len(), "data fetched from Orion");
        Ok(all)
    }
}

#[derive(Debug, Clone)]
pub struct OrionClientConfig {
    pub base_url: String,
    pub tenant_service: String,
    pub service_path: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for OrionClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/orion".to_string(),
            tenant_service: "fiware_project".to_string(),
            service_path: "/".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// NGSI v2 client. Every call carries the tenant header; lookups and writes add the service path.
#[derive(Debug, Clone)]
pub struct OrionClient {
    client: reqwest::Client,
    base_url: Url,
    tenant_service: String,
    service_path: String,
}

impl OrionClient {
    pub fn new(config: OrionClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .with_context(|| format!("parsing Orion base url {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Orion base url {} cannot carry a path", config.base_url);
        }
        Ok(Self {
            client,
            base_url,
            tenant_service: config.tenant_service,
            service_path: config.service_path,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends percent-encoded path segments, so ids never leak into query or fragment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn scoped(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header(HEADER_SERVICE, &self.tenant_service)
            .header(HEADER_SERVICE_PATH, &self.service_path)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        req.send().await.map_err(|err| classify_reqwest_error(&err))
    }
}

async fn expect_success(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.map_err(|err| classify_reqwest_error(&err))?;
    Err(StoreError::RemoteStatus {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ContextStore for OrionClient {
    async fn list_entities(
        &self,
        entity_type: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let req = self
            .client
            .get(self.url(&["v2", "entities"]))
            .header(HEADER_SERVICE, &self.tenant_service)
            .query(&[
                ("type", entity_type.to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ]);
        let resp = expect_success(self.send(req).await?).await?;
        let body = resp.bytes().await.map_err(|err| classify_reqwest_error(&err))?;
        serde_json::from_slice::<Vec<JsonValue>>(&body)
            .map_err(|err| StoreError::other(format!("decoding entity page: {err}")))
    }

    async fn lookup_entity(&self, id: &str) -> Result<Lookup, StoreError> {
        let req = self.scoped(self.client.get(self.url(&["v2", "entities", id])));
        let resp = self.send(req).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Lookup::NotFound);
        }
        expect_success(resp).await?;
        Ok(Lookup::Found)
    }

    async fn update_attrs(
        &self,
        id: &str,
        entity_type: &str,
        attrs: &EvacuationSpaceAttrs,
    ) -> Result<(), StoreError> {
        let req = self
            .scoped(
                self.client
                    .post(self.url(&["v2", "entities", id, "attrs"])),
            )
            .query(&[("type", entity_type)])
            .json(attrs);
        let span = info_span!("orion_update", id);
        expect_success(self.send(req).instrument(span).await?).await?;
        Ok(())
    }

    async fn create_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        let req = self
            .scoped(self.client.post(self.url(&["v2", "entities"])))
            .json(entity);
        let span = info_span!("orion_create", id = %entity.id);
        expect_success(self.send(req).instrument(span).await?).await?;
        Ok(())
    }

    async fn create_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Option<String>, StoreError> {
        let req = self
            .scoped(self.client.post(self.url(&["v2", "subscriptions"])))
            .json(subscription);
        let resp = expect_success(self.send(req).await?).await?;
        Ok(resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string))
    }
}
