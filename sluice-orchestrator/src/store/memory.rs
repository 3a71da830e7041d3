//! In-memory document store

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{DocumentStore, Kind, Record, StoreError};

/// Document store that lives as long as the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<(Kind, String), serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, kind: Kind, key: &str, data: serde_json::Value) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        let slot = (kind, key.to_string());
        if docs.contains_key(&slot) {
            return Err(StoreError::Conflict {
                kind,
                key: key.to_string(),
            });
        }
        docs.insert(slot, data);
        Ok(())
    }

    async fn update(&self, kind: Kind, key: &str, data: serde_json::Value) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        match docs.get_mut(&(kind, key.to_string())) {
            Some(doc) => {
                *doc = data;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind,
                key: key.to_string(),
            }),
        }
    }

    async fn delete(&self, kind: Kind, key: &str) -> Result<(), StoreError> {
        self.docs
            .write()
            .await
            .remove(&(kind, key.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind,
                key: key.to_string(),
            })
    }

    async fn get(&self, kind: Kind, key: &str) -> Result<Option<Record>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs.get(&(kind, key.to_string())).map(|data| Record {
            kind,
            key: key.to_string(),
            data: data.clone(),
        }))
    }

    async fn list(&self, kind: Kind) -> Result<Vec<Record>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((k, key), data)| Record {
                kind: *k,
                key: key.clone(),
                data: data.clone(),
            })
            .collect())
    }
}
