//! In-memory collection
//!
//! Records are kept as JSON objects so partial updates can merge fields
//! generically for every record kind.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{Collection, Record};

/// Collection held in process memory
pub struct MemoryCollection<R> {
    records: RwLock<BTreeMap<String, Value>>,
    _kind: PhantomData<fn() -> R>,
}

impl<R: Record> MemoryCollection<R> {
    #[must_use]
    pub fn new() -> Self {
        Self::from_entries(BTreeMap::new())
    }

    pub(crate) fn from_entries(entries: BTreeMap<String, Value>) -> Self {
        Self {
            records: RwLock::new(entries),
            _kind: PhantomData,
        }
    }

    pub(crate) async fn entries(&self) -> BTreeMap<String, Value> {
        self.records.read().await.clone()
    }
}

impl<R: Record> Default for MemoryCollection<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Record> Collection<R> for MemoryCollection<R> {
    async fn find(&self, id: &str) -> Result<Option<R>, StoreError> {
        let records = self.records.read().await;
        records
            .get(id)
            .map(|v| serde_json::from_value(v.clone()).map_err(StoreError::from))
            .transpose()
    }

    async fn find_all(&self) -> Result<Vec<R>, StoreError> {
        let records = self.records.read().await;
        records
            .values()
            .map(|v| serde_json::from_value(v.clone()).map_err(StoreError::from))
            .collect()
    }

    async fn save(&self, record: &R) -> Result<(), StoreError> {
        let value = serde_json::to_value(record)?;
        self.records
            .write()
            .await
            .insert(record.record_id().to_string(), value);
        Ok(())
    }

    async fn save_fields(&self, fields: &[&str], record: &R) -> Result<(), StoreError> {
        let incoming = serde_json::to_value(record)?;
        let mut records = self.records.write().await;

        let Some(Value::Object(stored)) = records.get_mut(record.record_id()) else {
            return Err(StoreError::NotFound {
                kind: R::KIND,
                id: record.record_id().to_string(),
            });
        };

        for field in fields {
            let value = incoming.get(*field).cloned().unwrap_or(Value::Null);
            stored.insert((*field).to_string(), value);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use shepherd_api::{DeployState, Host, Playbook};

    use super::*;

    #[tokio::test]
    async fn test_save_find_delete() {
        let store = MemoryCollection::<Playbook>::new();
        let pb = Playbook::new("base", "- hosts: all");

        store.save(&pb).await.unwrap();
        assert_eq!(store.find("base").await.unwrap(), Some(pb));
        assert!(store.exists("base").await.unwrap());

        assert!(store.delete("base").await.unwrap());
        assert!(!store.delete("base").await.unwrap());
        assert!(store.find("base").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_fields_only_touches_named_fields() {
        let store = MemoryCollection::<Host>::new();
        let mut host = Host::new("web1");
        host.state = DeployState::Acked;
        host.last_acked_playbook = Some("base".to_string());
        store.save(&host).await.unwrap();

        // A stale copy that only knows about liveness
        let seen = Host::seen("web1", Utc::now());
        store
            .save_fields(Host::LIVENESS_FIELDS, &seen)
            .await
            .unwrap();

        let stored = store.find("web1").await.unwrap().unwrap();
        assert_eq!(stored.state, DeployState::Acked);
        assert_eq!(stored.last_acked_playbook.as_deref(), Some("base"));
        assert_eq!(stored.last_seen_at, seen.last_seen_at);
    }

    #[tokio::test]
    async fn test_save_fields_missing_record() {
        let store = MemoryCollection::<Host>::new();
        let err = store
            .save_fields(Host::LIVENESS_FIELDS, &Host::new("ghost"))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_find_all() {
        let store = MemoryCollection::<Host>::new();
        store.save(&Host::new("a")).await.unwrap();
        store.save(&Host::new("b")).await.unwrap();
        store.save(&Host::new("a")).await.unwrap();

        let all = store.find_all().await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
