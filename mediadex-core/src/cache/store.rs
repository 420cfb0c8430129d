use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::object::{CacheEntry, CacheObject};
use crate::error::{IndexError, Result};
use crate::types::ids::ObjectId;

/// Occupancy ceiling of the default cache.
pub const STORAGE_CACHE_CAPACITY: usize = 29989;
/// Occupancy the cache shrinks back to once the ceiling is reached.
pub const STORAGE_CACHE_MAXFILL: usize = 9973;

struct Slot {
    entry: CacheEntry,
    seq: u64,
    location: Option<PathBuf>,
}

#[derive(Default)]
struct CacheState {
    ids: HashMap<ObjectId, Slot>,
    /// Insertion order, oldest first.
    order: BTreeMap<u64, ObjectId>,
    /// May reference ids that were evicted or removed since; those are misses.
    locations: HashMap<PathBuf, Vec<ObjectId>>,
    next_seq: u64,
    flushed: bool,
}

impl CacheState {
    /// Evicted ids leave the location index too, so it never outgrows the
    /// id index by more than what lazy removals left behind.
    fn evict_oldest(&mut self) -> Option<ObjectId> {
        let (_, id) = self.order.pop_first()?;
        if let Some(slot) = self.ids.remove(&id)
            && let Some(location) = slot.location
        {
            unlink_location(&mut self.locations, id, &location);
        }
        Some(id)
    }
}

fn unlink_location(locations: &mut HashMap<PathBuf, Vec<ObjectId>>, id: ObjectId, location: &Path) {
    if let Some(bucket) = locations.get_mut(location) {
        bucket.retain(|other| *other != id);
        if bucket.is_empty() {
            locations.remove(location);
        }
    }
}

/// Bounded object cache indexed by id and by location.
///
/// Eviction is oldest-inserted first. When an insert would bring occupancy to
/// the capacity ceiling, entries are evicted until occupancy drops below the
/// max-fill mark, then the insert completes. Re-reserving an evicted id
/// counts as a new insertion.
pub struct StorageCache {
    capacity: usize,
    max_fill: usize,
    state: Mutex<CacheState>,
}

impl fmt::Debug for StorageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("StorageCache");
        debug
            .field("capacity", &self.capacity)
            .field("max_fill", &self.max_fill);
        match self.state.try_lock() {
            Some(state) => {
                debug
                    .field("len", &state.ids.len())
                    .field("flushed", &state.flushed);
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl Default for StorageCache {
    fn default() -> Self {
        Self {
            capacity: STORAGE_CACHE_CAPACITY,
            max_fill: STORAGE_CACHE_MAXFILL,
            state: Mutex::new(CacheState::default()),
        }
    }
}

impl StorageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(capacity: usize, max_fill: usize) -> Result<Self> {
        if capacity <= max_fill {
            return Err(IndexError::InvalidConfig(format!(
                "cache capacity ({capacity}) must exceed max fill ({max_fill})"
            )));
        }
        Ok(Self {
            capacity,
            max_fill,
            state: Mutex::new(CacheState::default()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_fill(&self) -> usize {
        self.max_fill
    }

    pub fn len(&self) -> usize {
        self.state.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().ids.is_empty()
    }

    pub fn get(&self, id: ObjectId) -> Option<CacheEntry> {
        self.state
            .lock()
            .ids
            .get(&id)
            .map(|slot| Arc::clone(&slot.entry))
    }

    /// Return the entry for `id`, installing an empty placeholder if it is not
    /// cached yet. Concurrent callers for the same id get the same entry.
    pub fn get_or_reserve(&self, id: ObjectId) -> CacheEntry {
        let mut state = self.state.lock();
        if let Some(slot) = state.ids.get(&id) {
            return Arc::clone(&slot.entry);
        }

        self.ensure_fill_level(&mut state);

        let seq = state.next_seq;
        state.next_seq += 1;
        let entry: CacheEntry = Arc::new(Mutex::new(CacheObject::new(id)));
        state.order.insert(seq, id);
        state.ids.insert(
            id,
            Slot {
                entry: Arc::clone(&entry),
                seq,
                location: None,
            },
        );
        entry
    }

    fn ensure_fill_level(&self, state: &mut CacheState) {
        if state.ids.len() + 1 < self.capacity {
            return;
        }

        let before = state.ids.len();
        while state.ids.len() >= self.max_fill {
            if state.evict_oldest().is_none() {
                break;
            }
        }
        debug!(
            evicted = before - state.ids.len(),
            remaining = state.ids.len(),
            "storage cache shrunk to max fill"
        );
    }

    /// Drop `id` from the id index. The location index is left as is.
    pub fn remove(&self, id: ObjectId) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        let slot = state.ids.remove(&id)?;
        state.order.remove(&slot.seq);
        Some(slot.entry)
    }

    /// Cached objects currently located at `location`.
    pub fn get_by_location(&self, location: &Path) -> Vec<CacheEntry> {
        let state = self.state.lock();
        let Some(ids) = state.locations.get(location) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| state.ids.get(id))
            .filter(|slot| slot.location.as_deref() == Some(location))
            .map(|slot| Arc::clone(&slot.entry))
            .collect()
    }

    /// Record that the cached object `id` lives at `location`. Returns `false`
    /// when `id` is not cached.
    pub fn set_location(&self, id: ObjectId, location: &Path) -> bool {
        let mut state = self.state.lock();
        let CacheState { ids, locations, .. } = &mut *state;
        let Some(slot) = ids.get_mut(&id) else {
            return false;
        };
        if slot.location.as_deref() == Some(location) {
            return true;
        }

        if let Some(previous) = slot.location.take() {
            unlink_location(locations, id, &previous);
        }

        let location = location.to_path_buf();
        let bucket = locations.entry(location.clone()).or_default();
        if !bucket.contains(&id) {
            bucket.push(id);
        }
        slot.entry.lock().set_location(Some(location.clone()));
        slot.location = Some(location);
        true
    }

    /// Whether `id` is cached under `location`.
    pub fn check_location(&self, id: ObjectId, location: &Path) -> bool {
        self.state
            .lock()
            .ids
            .get(&id)
            .is_some_and(|slot| slot.location.as_deref() == Some(location))
    }

    /// Bump the child count of a cached parent whose count is known. Returns
    /// whether anything changed.
    pub fn add_child(&self, parent_id: ObjectId) -> bool {
        let entry = match self.state.lock().ids.get(&parent_id) {
            Some(slot) => Arc::clone(&slot.entry),
            None => return false,
        };
        let mut parent = entry.lock();
        match parent.num_children.as_mut() {
            Some(count) => {
                *count += 1;
                true
            }
            None => false,
        }
    }

    /// Drop everything. [`StorageCache::flushed`] reports `true` from now on.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.ids.len();
        state.ids.clear();
        state.order.clear();
        state.locations.clear();
        state.flushed = true;
        info!(dropped, "storage cache flushed");
    }

    pub fn flushed(&self) -> bool {
        self.state.lock().flushed
    }
}
