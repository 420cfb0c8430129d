use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::storage::{ContentStorage, NewObject, StoredObject};
use crate::autoscan::AutoscanRecord;
use crate::cache::{CacheEntry, StorageCache};
use crate::error::Result;
use crate::types::ids::ObjectId;

/// [`ContentStorage`] decorator answering object lookups from a
/// [`StorageCache`] where it can.
///
/// The cache is advisory: every write goes to the inner storage first and the
/// cache is only updated once that succeeded. Entry locks are never held
/// while calling back into the cache.
pub struct CachedStorage {
    inner: Arc<dyn ContentStorage>,
    cache: Arc<StorageCache>,
}

impl fmt::Debug for CachedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedStorage")
            .field("inner", &"dyn ContentStorage")
            .field("cache", &self.cache)
            .finish()
    }
}

impl CachedStorage {
    pub fn new(inner: Arc<dyn ContentStorage>, cache: Arc<StorageCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<StorageCache> {
        &self.cache
    }

    fn remember(&self, object: &StoredObject) -> CacheEntry {
        let entry = self.cache.get_or_reserve(object.id);
        {
            let mut cached = entry.lock();
            cached.parent_id = Some(object.parent_id);
            cached.is_container = object.is_container;
            cached.modified = object.modified;
        }
        self.cache.set_location(object.id, &object.location);
        entry
    }

    /// Complete cached summary of `id`, if there is one.
    fn cached_object(&self, id: ObjectId) -> Option<StoredObject> {
        let entry = self.cache.get(id)?;
        let cached = entry.lock();
        Some(StoredObject {
            id: cached.id,
            parent_id: cached.parent_id?,
            location: cached.location()?.to_path_buf(),
            is_container: cached.is_container,
            modified: cached.modified,
        })
    }

    fn forget_child_count(&self, id: ObjectId) {
        if let Some(entry) = self.cache.get(id) {
            entry.lock().num_children = None;
        }
    }
}

#[async_trait]
impl ContentStorage for CachedStorage {
    async fn find_object_id_by_path(&self, path: &Path) -> Result<Option<ObjectId>> {
        if let Some(entry) = self.cache.get_by_location(path).first() {
            let id = entry.lock().id;
            debug!(path = %path.display(), object_id = %id, "cache hit by location");
            return Ok(Some(id));
        }

        let found = self.inner.find_object_id_by_path(path).await?;
        if let Some(id) = found {
            self.cache.get_or_reserve(id);
            self.cache.set_location(id, path);
        }
        Ok(found)
    }

    async fn ensure_path_existence(&self, path: &Path) -> Result<ObjectId> {
        let id = self.inner.ensure_path_existence(path).await?;
        self.cache.get_or_reserve(id).lock().is_container = true;
        self.cache.set_location(id, path);
        Ok(id)
    }

    async fn add_object(&self, object: NewObject) -> Result<StoredObject> {
        let stored = self.inner.add_object(object).await?;
        let entry = self.remember(&stored);
        if stored.is_container {
            entry.lock().num_children = Some(0);
        }
        self.cache.add_child(stored.parent_id);
        Ok(stored)
    }

    async fn update_object(&self, object: &StoredObject) -> Result<()> {
        self.inner.update_object(object).await?;
        self.remember(object);
        Ok(())
    }

    async fn get_object(&self, id: ObjectId) -> Result<Option<StoredObject>> {
        if let Some(object) = self.cached_object(id) {
            debug!(object_id = %id, "cache hit");
            return Ok(Some(object));
        }

        debug!(object_id = %id, "cache miss");
        let found = self.inner.get_object(id).await?;
        if let Some(object) = &found {
            self.remember(object);
        }
        Ok(found)
    }

    async fn list_children(&self, id: ObjectId) -> Result<Vec<StoredObject>> {
        let children = self.inner.list_children(id).await?;
        for child in &children {
            self.remember(child);
        }
        if let Some(entry) = self.cache.get(id) {
            entry.lock().num_children = Some(u32::try_from(children.len()).unwrap_or(u32::MAX));
        }
        Ok(children)
    }

    async fn count_children(&self, id: ObjectId) -> Result<u32> {
        if let Some(count) = self.cache.get(id).and_then(|entry| entry.lock().num_children) {
            return Ok(count);
        }

        let count = self.inner.count_children(id).await?;
        if let Some(entry) = self.cache.get(id) {
            entry.lock().num_children = Some(count);
        }
        Ok(count)
    }

    async fn remove_object(&self, id: ObjectId, all: bool) -> Result<Vec<StoredObject>> {
        let removed = self.inner.remove_object(id, all).await?;
        for object in &removed {
            self.cache.remove(object.id);
        }
        if let Some(root) = removed.iter().find(|object| object.id == id) {
            self.forget_child_count(root.parent_id);
        }
        Ok(removed)
    }

    async fn total_files(&self) -> Result<u64> {
        self.inner.total_files().await
    }

    async fn update_autoscan(&self, record: &AutoscanRecord) -> Result<()> {
        self.inner.update_autoscan(record).await
    }

    async fn remove_autoscan(&self, location: &Path) -> Result<()> {
        self.inner.remove_autoscan(location).await
    }

    async fn load_autoscan_directories(&self) -> Result<Vec<AutoscanRecord>> {
        self.inner.load_autoscan_directories().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::storage::InMemoryStorage;
    use std::path::PathBuf;

    fn cached() -> (Arc<InMemoryStorage>, CachedStorage) {
        let inner = Arc::new(InMemoryStorage::new());
        let storage = CachedStorage::new(inner.clone(), Arc::new(StorageCache::new()));
        (inner, storage)
    }

    #[tokio::test]
    async fn cached_objects_survive_a_backend_outage() {
        let (inner, storage) = cached();
        let dir = storage.ensure_path_existence(Path::new("/media")).await.unwrap();
        let file = storage
            .add_object(NewObject {
                parent_id: dir,
                location: PathBuf::from("/media/a.mkv"),
                is_container: false,
                modified: None,
            })
            .await
            .unwrap();

        inner.set_unavailable(true);
        assert_eq!(storage.get_object(file.id).await.unwrap(), Some(file.clone()));
        assert_eq!(
            storage
                .find_object_id_by_path(Path::new("/media/a.mkv"))
                .await
                .unwrap(),
            Some(file.id)
        );
    }

    #[tokio::test]
    async fn child_counts_follow_adds_and_removals() {
        let (_inner, storage) = cached();
        let dir = storage.ensure_path_existence(Path::new("/media")).await.unwrap();
        assert_eq!(storage.count_children(dir).await.unwrap(), 0);

        let file = storage
            .add_object(NewObject {
                parent_id: dir,
                location: PathBuf::from("/media/a.mkv"),
                is_container: false,
                modified: None,
            })
            .await
            .unwrap();
        assert_eq!(storage.count_children(dir).await.unwrap(), 1);

        storage.remove_object(file.id, false).await.unwrap();
        assert!(storage.cache().get(file.id).is_none());
        assert_eq!(storage.count_children(dir).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flushed_cache_falls_back_to_storage() {
        let (_inner, storage) = cached();
        let dir = storage.ensure_path_existence(Path::new("/media")).await.unwrap();
        storage.cache().clear();

        let object = storage.get_object(dir).await.unwrap().unwrap();
        assert_eq!(object.location, PathBuf::from("/media"));
        assert!(storage.cache().flushed());
        assert!(storage.cache().get(dir).is_some());
    }
}
