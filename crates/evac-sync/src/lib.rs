//! One-shot reconciliation of the shelter dataset against the context store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use evac_adapters::{load_source_file, CsvOptions};
use evac_core::{map_row, Entity, ENTITY_TYPE};
use evac_storage::{
    ContextStore, EntitySelector, HttpEndpoint, Lookup, OrionClient, OrionClientConfig,
    PaginatedFetcher, StoreError, Subscription, SubscriptionNotification, SubscriptionSubject,
    DEFAULT_PAGE_SIZE,
};
use serde::Serialize;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "evac-sync";

pub const SUBSCRIPTION_DESCRIPTION: &str = "Notify Quantumleap of all context changes";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub tenant_service: String,
    pub service_path: String,
    pub store_base_url: String,
    pub notification_url: String,
    pub page_size: usize,
    pub entity_type: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub csv_path: PathBuf,
    pub csv_delimiter: u8,
    pub web_port: u16,
    pub log_file: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tenant_service: "fiware_project".to_string(),
            service_path: "/".to_string(),
            store_base_url: "http://localhost:8000/orion".to_string(),
            notification_url: "http://quantumleap:8668/v2/notify".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            entity_type: ENTITY_TYPE.to_string(),
            http_timeout_secs: 20,
            user_agent: "evac-sync/0.1".to_string(),
            csv_path: PathBuf::from("ibaraki.csv"),
            csv_delimiter: b',',
            web_port: 3001,
            log_file: PathBuf::from("app.log"),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            tenant_service: lookup("FIWARE_SERVICE").unwrap_or(defaults.tenant_service),
            service_path: lookup("FIWARE_SERVICE_PATH").unwrap_or(defaults.service_path),
            store_base_url: lookup("ORION_BASE_URL").unwrap_or(defaults.store_base_url),
            notification_url: lookup("NOTIFY_URL").unwrap_or(defaults.notification_url),
            page_size: lookup("ORION_PAGE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_size),
            entity_type: lookup("EVAC_ENTITY_TYPE").unwrap_or(defaults.entity_type),
            http_timeout_secs: lookup("EVAC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: lookup("EVAC_USER_AGENT").unwrap_or(defaults.user_agent),
            csv_path: lookup("EVAC_CSV_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.csv_path),
            csv_delimiter: lookup("EVAC_CSV_DELIMITER")
                .and_then(|v| match v.as_str() {
                    "\\t" | "tab" => Some(b'\t'),
                    other if other.len() == 1 => other.bytes().next(),
                    _ => None,
                })
                .unwrap_or(defaults.csv_delimiter),
            web_port: lookup("EVAC_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
            log_file: lookup("EVAC_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_file),
        }
    }

    pub fn orion_client_config(&self) -> OrionClientConfig {
        OrionClientConfig {
            base_url: self.store_base_url.clone(),
            tenant_service: self.tenant_service.clone(),
            service_path: self.service_path.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn fetcher(&self) -> PaginatedFetcher {
        PaginatedFetcher::new(self.entity_type.clone(), self.page_size)
    }

    pub fn csv_options(&self) -> CsvOptions {
        CsvOptions {
            delimiter: self.csv_delimiter,
        }
    }
}

pub fn connect_store(config: &SyncConfig) -> Result<Arc<dyn ContextStore>> {
    let client = OrionClient::new(config.orion_client_config())
        .with_context(|| format!("creating Orion client for {}", config.store_base_url))?;
    Ok(Arc::new(client))
}

/// Subscription matching every entity, delivered to `notification_url`.
pub fn change_subscription(notification_url: &str) -> Subscription {
    Subscription {
        description: SUBSCRIPTION_DESCRIPTION.to_string(),
        subject: SubscriptionSubject {
            entities: vec![EntitySelector {
                id_pattern: ".*".to_string(),
            }],
        },
        notification: SubscriptionNotification {
            http: HttpEndpoint {
                url: notification_url.to_string(),
            },
            metadata: vec!["dateCreated".to_string(), "dateModified".to_string()],
        },
    }
}

/// Best effort: a failed registration is logged and never stops the batch.
pub async fn register_subscription(store: &dyn ContextStore, notification_url: &str) -> bool {
    match store
        .create_subscription(&change_subscription(notification_url))
        .await
    {
        Ok(location) => {
            info!(
                location = location.as_deref().unwrap_or("unknown"),
                notification_url, "registered change subscription"
            );
            true
        }
        Err(err) => {
            error!(notification_url, error = %err, "subscription registration failed; continuing without it");
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    /// Existence check failed with something other than 404.
    Skipped(StoreError),
    CreateFailed(StoreError),
    UpdateFailed(StoreError),
}

/// Create-or-update against the store, one entity at a time in input order.
pub struct Reconciler {
    store: Arc<dyn ContextStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ContextStore>) -> Self {
        Self { store }
    }

    pub async fn reconcile_one(&self, entity: &Entity) -> ReconcileOutcome {
        debug!(
            id = %entity.id,
            payload = %serde_json::to_string(entity).unwrap_or_default(),
            "entity to be sent"
        );

        match self.store.lookup_entity(&entity.id).await {
            Ok(Lookup::Found) => match self
                .store
                .update_attrs(&entity.id, &entity.entity_type, entity.update_payload())
                .await
            {
                Ok(()) => {
                    info!(id = %entity.id, "updated entity in Orion");
                    ReconcileOutcome::Updated
                }
                Err(err) => {
                    error!(id = %entity.id, error = %err, "error while updating entity in Orion");
                    ReconcileOutcome::UpdateFailed(err)
                }
            },
            Ok(Lookup::NotFound) => match self.store.create_entity(entity).await {
                Ok(()) => {
                    info!(id = %entity.id, "created entity in Orion");
                    ReconcileOutcome::Created
                }
                Err(err) => {
                    error!(id = %entity.id, error = %err, "error while creating entity in Orion");
                    ReconcileOutcome::CreateFailed(err)
                }
            },
            Err(err) => {
                error!(id = %entity.id, error = %err, "error while checking entity in Orion");
                ReconcileOutcome::Skipped(err)
            }
        }
    }

    /// Number of entities newly created. Failures are isolated per entity.
    pub async fn reconcile(&self, entities: &[Entity]) -> usize {
        let mut created = 0usize;
        for entity in entities {
            if self.reconcile_one(entity).await == ReconcileOutcome::Created {
                created += 1;
            }
        }
        created
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_path: String,
    pub source_sha256: String,
    pub rows: usize,
    pub subscription_registered: bool,
    pub created: usize,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn ContextStore>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let store = connect_store(&config)?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: SyncConfig, store: Arc<dyn ContextStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let path = self.config.csv_path.clone();
        self.run_file(&path).await
    }

    /// Load, map, subscribe, reconcile. Only input problems abort the run, and they
    /// abort it before any remote call.
    pub async fn run_file(&self, path: &Path) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);

        async {
            let source = load_source_file(path, self.config.csv_options())
                .with_context(|| format!("loading {}", path.display()))?;
            info!(path = %path.display(), rows = source.rows.len(), sha256 = %source.sha256, "converted source rows");

            let entities = source
                .rows
                .iter()
                .enumerate()
                .map(|(idx, row)| map_row(row).with_context(|| format!("mapping row {}", idx + 1)))
                .collect::<Result<Vec<_>>>()?;

            let subscription_registered =
                register_subscription(self.store.as_ref(), &self.config.notification_url).await;

            let created = Reconciler::new(self.store.clone()).reconcile(&entities).await;
            info!(created, "Total entities registered in Orion: {created}");

            Ok::<_, anyhow::Error>(SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                source_path: path.display().to_string(),
                source_sha256: source.sha256,
                rows: entities.len(),
                subscription_registered,
                created,
            })
        }
        .instrument(span)
        .await
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env())?.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    use evac_core::{columns, SourceRow};
    use evac_storage::{MemoryContextStore, StoreCall};

    fn entity(code: &str, no: &str) -> Entity {
        let row: SourceRow = columns::REQUIRED
            .iter()
            .map(|c| match *c {
                columns::MUNICIPALITY_CODE => (*c, code),
                columns::SEQUENCE_NO => (*c, no),
                columns::LATITUDE => (*c, "36.12"),
                _ => (*c, "x"),
            })
            .collect();
        map_row(&row).unwrap()
    }

    fn seeded(ids: &[&Entity]) -> Arc<MemoryContextStore> {
        Arc::new(MemoryContextStore::with_entities(
            ids.iter().map(|e| serde_json::to_value(e).unwrap()).collect(),
        ))
    }

    fn server_error() -> StoreError {
        StoreError::RemoteStatus {
            status: 500,
            body: r#"{"error":"InternalError"}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn existing_entity_is_updated_not_created() {
        let existing = entity("082015", "1");
        let store = seeded(&[&existing]);
        let reconciler = Reconciler::new(store.clone());

        assert_eq!(reconciler.reconcile(std::slice::from_ref(&existing)).await, 0);
        assert_eq!(
            store.calls().await,
            vec![
                StoreCall::Lookup(existing.id.clone()),
                StoreCall::Update(existing.id.clone()),
            ]
        );
    }

    #[tokio::test]
    async fn missing_entity_is_created_and_counted() {
        let fresh = entity("082015", "2");
        let store = Arc::new(MemoryContextStore::new());
        let reconciler = Reconciler::new(store.clone());

        assert_eq!(reconciler.reconcile(std::slice::from_ref(&fresh)).await, 1);
        assert_eq!(
            store.calls().await,
            vec![StoreCall::Lookup(fresh.id.clone()), StoreCall::Create(fresh.id.clone())]
        );
        let stored = store.entity(&fresh.id).await.unwrap();
        assert_eq!(stored["type"], "EvacuationSpace");
        assert_eq!(stored["latitude"]["value"], 36.12);
    }

    #[tokio::test]
    async fn failed_create_is_not_counted_and_batch_continues() {
        let first = entity("082015", "1");
        let second = entity("082015", "2");
        let store = Arc::new(MemoryContextStore::new());
        store.fail_create(first.id.clone(), server_error()).await;
        let reconciler = Reconciler::new(store.clone());

        assert_eq!(reconciler.reconcile(&[first.clone(), second.clone()]).await, 1);
        assert!(store.entity(&first.id).await.is_none());
        assert!(store.entity(&second.id).await.is_some());
        assert_eq!(
            store.calls().await,
            vec![
                StoreCall::Lookup(first.id.clone()),
                StoreCall::Create(first.id.clone()),
                StoreCall::Lookup(second.id.clone()),
                StoreCall::Create(second.id.clone()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_existence_check_skips_entity() {
        let target = entity("082015", "3");
        let store = Arc::new(MemoryContextStore::new());
        store.fail_lookup(target.id.clone(), server_error()).await;
        let reconciler = Reconciler::new(store.clone());

        assert_eq!(
            reconciler.reconcile_one(&target).await,
            ReconcileOutcome::Skipped(server_error())
        );
        assert_eq!(store.calls().await, vec![StoreCall::Lookup(target.id.clone())]);

        store
            .fail_lookup(
                target.id.clone(),
                StoreError::TransportUnreachable { message: "connection refused".into() },
            )
            .await;
        assert!(matches!(
            reconciler.reconcile_one(&target).await,
            ReconcileOutcome::Skipped(StoreError::TransportUnreachable { .. })
        ));
    }

    #[tokio::test]
    async fn failed_update_is_isolated() {
        let a = entity("082015", "1");
        let b = entity("082015", "2");
        let store = seeded(&[&a]);
        store.fail_update(a.id.clone(), server_error()).await;
        let reconciler = Reconciler::new(store.clone());

        assert_eq!(
            reconciler.reconcile_one(&a).await,
            ReconcileOutcome::UpdateFailed(server_error())
        );
        assert_eq!(reconciler.reconcile_one(&b).await, ReconcileOutcome::Created);
    }

    #[test]
    fn subscription_matches_everything() {
        let sub = change_subscription("http://quantumleap:8668/v2/notify");
        let json = serde_json::to_value(&sub).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "description": "Notify Quantumleap of all context changes",
                "subject": { "entities": [{ "idPattern": ".*" }] },
                "notification": {
                    "http": { "url": "http://quantumleap:8668/v2/notify" },
                    "metadata": ["dateCreated", "dateModified"]
                }
            })
        );
    }

    const HEADER: &str = "市町村コード,NO,施設・場所名,都道府県名及び市町村名,住所,緯度,経度,洪水,崖崩れ、土石流及び地滑り,高潮,地震,津波,大規模な火事,内水氾濫,火山現象,指定避難所との住所同一";

    fn three_row_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{HEADER}").unwrap();
        writeln!(file, "082015,1,第一小学校,茨城県水戸市,三の丸1,36.37,140.47,1,,,1,,1,,,").unwrap();
        writeln!(file, "082015,2,第二小学校,茨城県水戸市,本町2,36.38,140.48,1,,,1,,1,,,").unwrap();
        writeln!(file, "082015,3,市民会館,茨城県水戸市,泉町3,,,1,,,1,,1,,,").unwrap();
        file
    }

    #[tokio::test]
    async fn three_row_batch_creates_two_and_updates_one() {
        let file = three_row_file();
        let store = seeded(&[&entity("082015", "2")]);
        let pipeline = SyncPipeline::with_store(SyncConfig::default(), store.clone());

        let summary = pipeline.run_file(file.path()).await.unwrap();
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.created, 2);
        assert!(summary.subscription_registered);
        assert_eq!(summary.source_sha256.len(), 64);

        let calls = store.calls().await;
        assert_eq!(
            calls,
            vec![
                StoreCall::Subscribe,
                StoreCall::Lookup("EvacuationSpace_082015_1".into()),
                StoreCall::Create("EvacuationSpace_082015_1".into()),
                StoreCall::Lookup("EvacuationSpace_082015_2".into()),
                StoreCall::Update("EvacuationSpace_082015_2".into()),
                StoreCall::Lookup("EvacuationSpace_082015_3".into()),
                StoreCall::Create("EvacuationSpace_082015_3".into()),
            ]
        );
        let updated = store.entity("EvacuationSpace_082015_2").await.unwrap();
        assert_eq!(updated["name"]["value"], "第二小学校");
        assert_eq!(store.subscriptions().await.len(), 1);
    }

    #[tokio::test]
    async fn subscription_failure_does_not_stop_the_batch() {
        let file = three_row_file();
        let store = Arc::new(MemoryContextStore::new());
        store.fail_subscriptions(server_error()).await;
        let pipeline = SyncPipeline::with_store(SyncConfig::default(), store.clone());

        let summary = pipeline.run_file(file.path()).await.unwrap();
        assert!(!summary.subscription_registered);
        assert_eq!(summary.created, 3);
    }

    #[tokio::test]
    async fn run_summary_serializes_for_reporting() {
        let file = three_row_file();
        let store = seeded(&[&entity("082015", "2")]);
        let pipeline = SyncPipeline::with_store(SyncConfig::default(), store);

        let summary = pipeline.run_file(file.path()).await.unwrap();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["run_id"], summary.run_id.to_string());
        assert_eq!(json["rows"], 3);
        assert_eq!(json["created"], 2);
        assert_eq!(json["subscription_registered"], true);
        assert_eq!(json["source_sha256"], summary.source_sha256);
        assert!(json["started_at"].is_string());
    }

    #[tokio::test]
    async fn missing_file_fails_before_any_remote_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryContextStore::new());
        let pipeline = SyncPipeline::with_store(SyncConfig::default(), store.clone());

        let err = pipeline
            .run_file(&dir.path().join("ibaraki.csv"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("File does not exist"));
        assert!(store.calls().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_header_fails_before_any_remote_call() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "市町村コード,NO").unwrap();
        writeln!(file, "082015,1").unwrap();
        let store = Arc::new(MemoryContextStore::new());
        let pipeline = SyncPipeline::with_store(SyncConfig::default(), store.clone());

        assert!(pipeline.run_file(file.path()).await.is_err());
        assert!(store.calls().await.is_empty());
    }

    #[test]
    fn config_reads_overrides_and_keeps_defaults() {
        let env = HashMap::from([
            ("FIWARE_SERVICE", "openiot"),
            ("ORION_BASE_URL", "http://localhost:1026"),
            ("ORION_PAGE_SIZE", "250"),
            ("EVAC_WEB_PORT", "not-a-port"),
            ("EVAC_CSV_DELIMITER", "tab"),
        ]);
        let config = SyncConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.tenant_service, "openiot");
        assert_eq!(config.store_base_url, "http://localhost:1026");
        assert_eq!(config.page_size, 250);
        assert_eq!(config.web_port, 3001);
        assert_eq!(config.csv_delimiter, b'\t');
        assert_eq!(config.service_path, "/");
        assert_eq!(config.notification_url, "http://quantumleap:8668/v2/notify");
        assert_eq!(config.fetcher().page_size(), 250);
    }
}
