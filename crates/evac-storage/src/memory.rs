//! In-process `ContextStore` for local runs and pipeline tests.
//!
//! Entities are kept in insertion order so offset pagination is stable. Every call is
//! recorded, and individual operations can be made to fail on demand.

use std::collections::HashMap;

use async_trait::async_trait;
use evac_core::{Entity, EvacuationSpaceAttrs};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{ContextStore, Lookup, StoreError, Subscription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    List { offset: usize, limit: usize },
    Lookup(String),
    Update(String),
    Create(String),
    Subscribe,
}

#[derive(Debug, Default)]
struct State {
    entities: Vec<JsonValue>,
    subscriptions: Vec<Subscription>,
    calls: Vec<StoreCall>,
    lookup_failures: HashMap<String, StoreError>,
    update_failures: HashMap<String, StoreError>,
    create_failures: HashMap<String, StoreError>,
    list_failures: HashMap<usize, StoreError>,
    subscription_failure: Option<StoreError>,
}

impl State {
    fn position(&self, id: &str) -> Option<usize> {
        self.entities
            .iter()
            .position(|e| e.get("id").and_then(JsonValue::as_str) == Some(id))
    }
}

#[derive(Debug, Default)]
pub struct MemoryContextStore {
    state: Mutex<State>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: Vec<JsonValue>) -> Self {
        Self {
            state: Mutex::new(State {
                entities,
                ..State::default()
            }),
        }
    }

    pub async fn insert(&self, entity: JsonValue) {
        self.state.lock().await.entities.push(entity);
    }

    pub async fn entities(&self) -> Vec<JsonValue> {
        self.state.lock().await.entities.clone()
    }

    pub async fn entity(&self, id: &str) -> Option<JsonValue> {
        let state = self.state.lock().await;
        state.position(id).map(|idx| state.entities[idx].clone())
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.state.lock().await.subscriptions.clone()
    }

    pub async fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn fail_lookup(&self, id: impl Into<String>, err: StoreError) {
        self.state.lock().await.lookup_failures.insert(id.into(), err);
    }

    pub async fn fail_update(&self, id: impl Into<String>, err: StoreError) {
        self.state.lock().await.update_failures.insert(id.into(), err);
    }

    pub async fn fail_create(&self, id: impl Into<String>, err: StoreError) {
        self.state.lock().await.create_failures.insert(id.into(), err);
    }

    pub async fn fail_list_at(&self, offset: usize, err: StoreError) {
        self.state.lock().await.list_failures.insert(offset, err);
    }

    pub async fn fail_subscriptions(&self, err: StoreError) {
        self.state.lock().await.subscription_failure = Some(err);
    }
}

fn not_found() -> StoreError {
    StoreError::RemoteStatus {
        status: 404,
        body: r#"{"error":"NotFound","description":"The requested entity has not been found. Check type and id"}"#
            .to_string(),
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn list_entities(
        &self,
        entity_type: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::List { offset, limit });
        if let Some(err) = state.list_failures.get(&offset) {
            return Err(err.clone());
        }
        Ok(state
            .entities
            .iter()
            .filter(|e| e.get("type").and_then(JsonValue::as_str) == Some(entity_type))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn lookup_entity(&self, id: &str) -> Result<Lookup, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::Lookup(id.to_string()));
        if let Some(err) = state.lookup_failures.get(id) {
            return Err(err.clone());
        }
        Ok(match state.position(id) {
            Some(_) => Lookup::Found,
            None => Lookup::NotFound,
        })
    }

    async fn update_attrs(
        &self,
        id: &str,
        _entity_type: &str,
        attrs: &EvacuationSpaceAttrs,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::Update(id.to_string()));
        if let Some(err) = state.update_failures.get(id) {
            return Err(err.clone());
        }
        let Some(idx) = state.position(id) else {
            return Err(not_found());
        };
        let patch = serde_json::to_value(attrs).map_err(|err| StoreError::other(err.to_string()))?;
        if let (Some(target), JsonValue::Object(fields)) = (state.entities[idx].as_object_mut(), patch) {
            target.extend(fields);
        }
        Ok(())
    }

    async fn create_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::Create(entity.id.clone()));
        if let Some(err) = state.create_failures.get(&entity.id) {
            return Err(err.clone());
        }
        if state.position(&entity.id).is_some() {
            return Err(StoreError::RemoteStatus {
                status: 422,
                body: r#"{"error":"Unprocessable","description":"Already Exists"}"#.to_string(),
            });
        }
        let doc = serde_json::to_value(entity).map_err(|err| StoreError::other(err.to_string()))?;
        state.entities.push(doc);
        Ok(())
    }

    async fn create_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::Subscribe);
        if let Some(err) = &state.subscription_failure {
            return Err(err.clone());
        }
        state.subscriptions.push(subscription.clone());
        Ok(Some(format!("/v2/subscriptions/{}", state.subscriptions.len())))
    }
}
