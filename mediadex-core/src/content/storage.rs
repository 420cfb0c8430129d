use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::autoscan::AutoscanRecord;
use crate::error::{IndexError, Result};
use crate::types::ids::ObjectId;

/// An object as the storage engine knows it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: ObjectId,
    pub parent_id: ObjectId,
    pub location: PathBuf,
    pub is_container: bool,
    pub modified: Option<DateTime<Utc>>,
}

/// Input for [`ContentStorage::add_object`]; the engine allocates the id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewObject {
    pub parent_id: ObjectId,
    pub location: PathBuf,
    pub is_container: bool,
    pub modified: Option<DateTime<Utc>>,
}

/// Persistent store of the object graph and autoscan records.
#[async_trait]
pub trait ContentStorage: Send + Sync {
    async fn find_object_id_by_path(&self, path: &Path) -> Result<Option<ObjectId>>;

    /// Make sure a container exists for `path` and every ancestor, creating
    /// the missing ones. Returns the id of the container at `path`.
    async fn ensure_path_existence(&self, path: &Path) -> Result<ObjectId>;

    async fn add_object(&self, object: NewObject) -> Result<StoredObject>;

    async fn update_object(&self, object: &StoredObject) -> Result<()>;

    async fn get_object(&self, id: ObjectId) -> Result<Option<StoredObject>>;

    async fn list_children(&self, id: ObjectId) -> Result<Vec<StoredObject>>;

    async fn count_children(&self, id: ObjectId) -> Result<u32>;

    /// Remove `id`. A non-empty container is only removed together with its
    /// descendants when `all` is set. Returns every removed object.
    async fn remove_object(&self, id: ObjectId, all: bool) -> Result<Vec<StoredObject>>;

    /// Number of non-container objects.
    async fn total_files(&self) -> Result<u64>;

    /// Insert or replace the record keyed by its location.
    async fn update_autoscan(&self, record: &AutoscanRecord) -> Result<()>;

    async fn remove_autoscan(&self, location: &Path) -> Result<()>;

    async fn load_autoscan_directories(&self) -> Result<Vec<AutoscanRecord>>;
}

#[derive(Default)]
struct StorageState {
    objects: HashMap<ObjectId, StoredObject>,
    by_path: HashMap<PathBuf, ObjectId>,
    children: HashMap<ObjectId, Vec<ObjectId>>,
    autoscans: BTreeMap<PathBuf, AutoscanRecord>,
    next_id: i64,
}

impl StorageState {
    fn insert(&mut self, object: NewObject) -> StoredObject {
        self.next_id += 1;
        let stored = StoredObject {
            id: ObjectId(self.next_id),
            parent_id: object.parent_id,
            location: object.location,
            is_container: object.is_container,
            modified: object.modified,
        };
        self.by_path.insert(stored.location.clone(), stored.id);
        self.children
            .entry(stored.parent_id)
            .or_default()
            .push(stored.id);
        self.objects.insert(stored.id, stored.clone());
        stored
    }

    fn collect_subtree(&self, id: ObjectId, out: &mut Vec<ObjectId>) {
        if let Some(children) = self.children.get(&id) {
            for child in children {
                self.collect_subtree(*child, out);
            }
        }
        out.push(id);
    }

    fn unlink(&mut self, id: ObjectId) -> Option<StoredObject> {
        let object = self.objects.remove(&id)?;
        self.by_path.remove(&object.location);
        self.children.remove(&id);
        if let Some(siblings) = self.children.get_mut(&object.parent_id) {
            siblings.retain(|sibling| *sibling != id);
        }
        Some(object)
    }
}

/// [`ContentStorage`] kept entirely in memory. Object ids start at 1;
/// [`ObjectId::ROOT`] is the implicit parent of top-level containers.
#[derive(Default)]
pub struct InMemoryStorage {
    state: RwLock<StorageState>,
    unavailable: AtomicBool,
}

impl fmt::Debug for InMemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryStorage");
        match self.state.try_read() {
            Some(state) => {
                debug
                    .field("objects", &state.objects.len())
                    .field("autoscans", &state.autoscans.len());
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .finish()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`IndexError::Storage`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(IndexError::Storage("storage backend unavailable".into()))
        } else {
            Ok(())
        }
    }

    pub fn object_count(&self) -> usize {
        self.state.read().objects.len()
    }

    pub fn autoscan_record(&self, location: &Path) -> Option<AutoscanRecord> {
        self.state.read().autoscans.get(location).cloned()
    }
}

#[async_trait]
impl ContentStorage for InMemoryStorage {
    async fn find_object_id_by_path(&self, path: &Path) -> Result<Option<ObjectId>> {
        self.check_available()?;
        Ok(self.state.read().by_path.get(path).copied())
    }

    async fn ensure_path_existence(&self, path: &Path) -> Result<ObjectId> {
        self.check_available()?;
        let mut state = self.state.write();

        let chain: Vec<&Path> = path
            .ancestors()
            .filter(|ancestor| ancestor.parent().is_some())
            .collect();

        let mut parent = ObjectId::ROOT;
        for ancestor in chain.into_iter().rev() {
            parent = match state.by_path.get(ancestor).copied() {
                Some(id) => {
                    if state.objects.get(&id).is_some_and(|obj| !obj.is_container) {
                        return Err(IndexError::Storage(format!(
                            "{} is not a container",
                            ancestor.display()
                        )));
                    }
                    id
                }
                None => {
                    state
                        .insert(NewObject {
                            parent_id: parent,
                            location: ancestor.to_path_buf(),
                            is_container: true,
                            modified: None,
                        })
                        .id
                }
            };
        }
        Ok(parent)
    }

    async fn add_object(&self, object: NewObject) -> Result<StoredObject> {
        self.check_available()?;
        let mut state = self.state.write();
        if state.by_path.contains_key(&object.location) {
            return Err(IndexError::Storage(format!(
                "object already stored for {}",
                object.location.display()
            )));
        }
        if object.parent_id != ObjectId::ROOT && !state.objects.contains_key(&object.parent_id) {
            return Err(IndexError::Storage(format!(
                "parent {} does not exist",
                object.parent_id
            )));
        }
        Ok(state.insert(object))
    }

    async fn update_object(&self, object: &StoredObject) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write();
        match state.objects.get_mut(&object.id) {
            Some(stored) if stored.location == object.location => {
                stored.modified = object.modified;
                stored.is_container = object.is_container;
                Ok(())
            }
            Some(_) => Err(IndexError::Storage(format!(
                "object {} cannot be moved",
                object.id
            ))),
            None => Err(IndexError::Storage(format!(
                "object {} does not exist",
                object.id
            ))),
        }
    }

    async fn get_object(&self, id: ObjectId) -> Result<Option<StoredObject>> {
        self.check_available()?;
        Ok(self.state.read().objects.get(&id).cloned())
    }

    async fn list_children(&self, id: ObjectId) -> Result<Vec<StoredObject>> {
        self.check_available()?;
        let state = self.state.read();
        Ok(state
            .children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|child| state.objects.get(child).cloned())
            .collect())
    }

    async fn count_children(&self, id: ObjectId) -> Result<u32> {
        self.check_available()?;
        let count = self.state.read().children.get(&id).map_or(0, Vec::len);
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn remove_object(&self, id: ObjectId, all: bool) -> Result<Vec<StoredObject>> {
        self.check_available()?;
        if id == ObjectId::ROOT {
            return Err(IndexError::InvalidOperation(
                "the root container cannot be removed".into(),
            ));
        }

        let mut state = self.state.write();
        if !state.objects.contains_key(&id) {
            return Ok(Vec::new());
        }
        let has_children = state.children.get(&id).is_some_and(|c| !c.is_empty());
        if has_children && !all {
            return Err(IndexError::Storage(format!(
                "object {id} still has children"
            )));
        }

        let mut doomed = Vec::new();
        state.collect_subtree(id, &mut doomed);
        Ok(doomed
            .into_iter()
            .filter_map(|victim| state.unlink(victim))
            .collect())
    }

    async fn total_files(&self) -> Result<u64> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .objects
            .values()
            .filter(|obj| !obj.is_container)
            .count() as u64)
    }

    async fn update_autoscan(&self, record: &AutoscanRecord) -> Result<()> {
        self.check_available()?;
        self.state
            .write()
            .autoscans
            .insert(record.location.clone(), record.clone());
        Ok(())
    }

    async fn remove_autoscan(&self, location: &Path) -> Result<()> {
        self.check_available()?;
        self.state.write().autoscans.remove(location);
        Ok(())
    }

    async fn load_autoscan_directories(&self) -> Result<Vec<AutoscanRecord>> {
        self.check_available()?;
        Ok(self.state.read().autoscans.values().cloned().collect())
    }
}
