//! In-memory object store for tests and simulation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ETag, ObjectProperties, ObjectStore, StoreError, check_etag};
use crate::types::Metadata;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    metadata: Metadata,
    etag: ETag,
}

/// Object store held entirely in process memory.
///
/// ETags come from a store-wide counter, so a deleted and recreated object
/// never reuses a tag.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    next_etag: AtomicU64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_etag(&self) -> ETag {
        ETag(self.next_etag.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Number of objects currently stored.
    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn create_if_not_exists(
        &self,
        name: &str,
        metadata: &Metadata,
    ) -> Result<Option<ETag>, StoreError> {
        let mut objects = self.objects.lock().await;
        if objects.contains_key(name) {
            return Ok(None);
        }
        let etag = self.fresh_etag();
        objects.insert(
            name.to_string(),
            StoredObject {
                data: Vec::new(),
                metadata: metadata.clone(),
                etag,
            },
        );
        Ok(Some(etag))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectProperties>, StoreError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, obj)| ObjectProperties {
                name: name.clone(),
                metadata: obj.metadata.clone(),
                etag: obj.etag,
            })
            .collect())
    }

    async fn properties(&self, name: &str) -> Result<ObjectProperties, StoreError> {
        let objects = self.objects.lock().await;
        let obj = objects
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(ObjectProperties {
            name: name.to_string(),
            metadata: obj.metadata.clone(),
            etag: obj.etag,
        })
    }

    async fn read(&self, name: &str) -> Result<(Vec<u8>, ETag), StoreError> {
        let objects = self.objects.lock().await;
        let obj = objects
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok((obj.data.clone(), obj.etag))
    }

    async fn append(&self, name: &str, block: &[u8], if_match: ETag) -> Result<ETag, StoreError> {
        let mut objects = self.objects.lock().await;
        let obj = objects
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        check_etag(name, if_match, obj.etag)?;
        obj.data.extend_from_slice(block);
        obj.etag = self.fresh_etag();
        Ok(obj.etag)
    }

    async fn set_metadata(
        &self,
        name: &str,
        metadata: &Metadata,
        if_match: ETag,
    ) -> Result<ETag, StoreError> {
        let mut objects = self.objects.lock().await;
        let obj = objects
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        check_etag(name, if_match, obj.etag)?;
        obj.metadata = metadata.clone();
        obj.etag = self.fresh_etag();
        Ok(obj.etag)
    }

    async fn delete(&self, name: &str, if_match: ETag) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().await;
        let obj = objects
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        check_etag(name, if_match, obj.etag)?;
        objects.remove(name);
        Ok(())
    }
}
