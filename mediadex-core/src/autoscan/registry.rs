use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::directory::{AutoscanDirectory, SharedDirectory};
use super::timer::{TimerParameter, TimerSubscriber};
use crate::error::{IndexError, Result};
use crate::types::ids::{ObjectId, ScanId};

/// Slot table backing the registry. A scan id is an index into `entries`;
/// `None` marks a tombstone whose index sits in `free`.
#[derive(Default)]
struct Slots {
    entries: Vec<Option<SharedDirectory>>,
    free: BTreeSet<usize>,
}

impl Slots {
    fn active(&self) -> impl Iterator<Item = (usize, &SharedDirectory)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|dir| (index, dir)))
    }

    fn position_by_location(&self, location: &Path) -> Option<usize> {
        self.active()
            .find(|(_, dir)| dir.location() == Some(location))
            .map(|(index, _)| index)
    }

    fn insert(&mut self, dir: SharedDirectory) -> ScanId {
        let index = match self.free.pop_first() {
            Some(index) => {
                self.entries[index] = Some(Arc::clone(&dir));
                index
            }
            None => {
                self.entries.push(Some(Arc::clone(&dir)));
                self.entries.len() - 1
            }
        };
        let scan_id = ScanId(index);
        dir.set_scan_id(Some(scan_id));
        scan_id
    }

    fn release(&mut self, index: usize) -> Option<SharedDirectory> {
        let dir = self.entries.get_mut(index)?.take()?;
        dir.set_scan_id(None);
        if index + 1 == self.entries.len() {
            self.entries.pop();
        } else {
            self.free.insert(index);
        }
        Some(dir)
    }
}

/// Whether `dir` falls under `parent` for a subtree removal. Matching is a
/// plain prefix on the location string, so `/ab` is under `/a`.
pub(crate) fn in_subtree(dir: &AutoscanDirectory, parent: &Path, include_persistent: bool) -> bool {
    dir.location().is_some_and(|location| {
        location
            .as_os_str()
            .as_encoded_bytes()
            .starts_with(parent.as_os_str().as_encoded_bytes())
    }) && (include_persistent || !dir.persistent())
}

/// Ordered collection of watched directories addressed by scan id.
///
/// Every operation takes the registry lock for its whole duration. Removing
/// the last slot shrinks the table, removing any other slot leaves a tombstone
/// that the next [`AutoscanRegistry::add`] fills, so scan ids handed out for
/// other entries never shift.
#[derive(Default)]
pub struct AutoscanRegistry {
    slots: Mutex<Slots>,
}

impl fmt::Debug for AutoscanRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("AutoscanRegistry");
        match self.slots.try_lock() {
            Some(slots) => {
                let locations: Vec<_> = slots
                    .active()
                    .map(|(index, dir)| (index, dir.location().map(Path::to_path_buf)))
                    .collect();
                debug
                    .field("slots", &slots.entries.len())
                    .field("active", &locations);
            }
            None => {
                debug.field("slots", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl AutoscanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `dir` and return its scan id.
    pub fn add(&self, dir: SharedDirectory) -> Result<ScanId> {
        let Some(location) = dir.location().map(Path::to_path_buf) else {
            return Err(IndexError::InvalidOperation(
                "autoscan directory has no location".into(),
            ));
        };

        let mut slots = self.slots.lock();
        if slots.position_by_location(&location).is_some() {
            return Err(IndexError::DuplicateWatch(location));
        }
        let scan_id = slots.insert(dir);
        debug!(scan_id = %scan_id, location = %location.display(), "autoscan directory added");
        Ok(scan_id)
    }

    /// Add every active entry of `other`. Stops at the first failure; entries
    /// added before it stay registered.
    pub fn add_all(&self, other: &AutoscanRegistry) -> Result<()> {
        for dir in other.snapshot() {
            self.add(dir)?;
        }
        Ok(())
    }

    pub fn get(&self, scan_id: ScanId) -> Option<SharedDirectory> {
        self.slots
            .lock()
            .entries
            .get(scan_id.index())
            .and_then(|slot| slot.clone())
    }

    pub fn get_by_location(&self, location: &Path) -> Option<SharedDirectory> {
        self.slots
            .lock()
            .active()
            .find(|(_, dir)| dir.location() == Some(location))
            .map(|(_, dir)| Arc::clone(dir))
    }

    pub fn get_by_object_id(&self, object_id: ObjectId) -> Option<SharedDirectory> {
        self.slots
            .lock()
            .active()
            .find(|(_, dir)| dir.object_id() == Some(object_id))
            .map(|(_, dir)| Arc::clone(dir))
    }

    /// Unregister the entry at `scan_id`. Returns the removed directory, whose
    /// scan id is cleared.
    pub fn remove(&self, scan_id: ScanId) -> Option<SharedDirectory> {
        let removed = self.slots.lock().release(scan_id.index());
        match &removed {
            Some(_) => debug!(scan_id = %scan_id, "autoscan directory removed"),
            None => debug!(scan_id = %scan_id, "no autoscan directory to remove"),
        }
        removed
    }

    pub fn remove_by_location(&self, location: &Path) -> Option<SharedDirectory> {
        let mut slots = self.slots.lock();
        let Some(index) = slots.position_by_location(location) else {
            debug!(location = %location.display(), "no autoscan directory to remove");
            return None;
        };
        debug!(scan_id = index, location = %location.display(), "autoscan directory removed");
        slots.release(index)
    }

    pub fn remove_by_object_id(&self, object_id: ObjectId) -> Option<SharedDirectory> {
        let mut slots = self.slots.lock();
        let index = slots
            .active()
            .find(|(_, dir)| dir.object_id() == Some(object_id))
            .map(|(index, _)| index);
        let Some(index) = index else {
            debug!(object_id = %object_id, "no autoscan directory to remove");
            return None;
        };
        debug!(scan_id = index, object_id = %object_id, "autoscan directory removed");
        slots.release(index)
    }

    /// Remove every entry located at or below `parent`. Persistent entries are
    /// kept unless `include_persistent` is set.
    ///
    /// The removed entries are returned as independent copies in a new
    /// registry with scan ids of its own.
    pub fn remove_subtree(&self, parent: &Path, include_persistent: bool) -> AutoscanRegistry {
        let removed = AutoscanRegistry::new();
        let mut slots = self.slots.lock();

        let targets: Vec<usize> = slots
            .active()
            .filter(|(_, dir)| in_subtree(dir, parent, include_persistent))
            .map(|(index, _)| index)
            .collect();

        let mut removed_slots = removed.slots.lock();
        for index in targets {
            if let Some(dir) = slots.release(index) {
                removed_slots.insert(Arc::new(dir.duplicate()));
            }
        }
        drop(removed_slots);

        debug!(
            parent = %parent.display(),
            include_persistent,
            removed = removed.len(),
            "autoscan subtree removed"
        );
        removed
    }

    /// Hand every active entry's timer parameter to `subscriber`. The
    /// parameters are collected under the lock and delivered after it is
    /// released, so the subscriber may call back into the registry.
    pub fn notify_all(&self, subscriber: &dyn TimerSubscriber) {
        let parameters: Vec<TimerParameter> = self
            .slots
            .lock()
            .active()
            .map(|(_, dir)| dir.timer_parameter())
            .collect();
        for parameter in parameters {
            subscriber.timer_notify(parameter);
        }
    }

    /// Active entries in scan id order.
    pub fn snapshot(&self) -> Vec<SharedDirectory> {
        self.slots
            .lock()
            .active()
            .map(|(_, dir)| Arc::clone(dir))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().active().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscan::directory::AutoscanSettings;
    use std::path::PathBuf;

    fn dir(location: &str) -> SharedDirectory {
        AutoscanDirectory::new(location, AutoscanSettings::default()).shared()
    }

    fn persistent(location: &str) -> SharedDirectory {
        AutoscanDirectory::new(
            location,
            AutoscanSettings {
                persistent: true,
                ..AutoscanSettings::default()
            },
        )
        .shared()
    }

    #[test]
    fn tail_removal_truncates_and_middle_removal_tombstones() {
        let registry = AutoscanRegistry::new();
        let a = registry.add(dir("/a")).unwrap();
        let b = registry.add(dir("/b")).unwrap();
        let c = registry.add(dir("/c")).unwrap();
        assert_eq!((a, b, c), (ScanId(0), ScanId(1), ScanId(2)));

        registry.remove(b).expect("b was registered");
        assert!(registry.get(b).is_none());
        assert_eq!(registry.get(c).unwrap().location(), Some(Path::new("/c")));

        registry.remove(c).expect("c was registered");
        assert_eq!(registry.slots.lock().entries.len(), 2);

        // The tombstone left by /b is reused before the table grows.
        assert_eq!(registry.add(dir("/d")).unwrap(), ScanId(1));
        assert_eq!(registry.add(dir("/e")).unwrap(), ScanId(2));
    }

    #[test]
    fn removed_directory_loses_its_scan_id() {
        let registry = AutoscanRegistry::new();
        let media = dir("/media");
        registry.add(Arc::clone(&media)).unwrap();
        assert_eq!(media.scan_id(), Some(ScanId(0)));

        registry.remove_by_location(Path::new("/media"));
        assert_eq!(media.scan_id(), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn missing_entries_are_a_silent_no_op() {
        let registry = AutoscanRegistry::new();
        assert!(registry.remove(ScanId(4)).is_none());
        assert!(registry.remove_by_location(Path::new("/nowhere")).is_none());
        assert!(registry.remove_by_object_id(ObjectId(12)).is_none());
    }

    #[test]
    fn lookup_by_object_id() {
        let registry = AutoscanRegistry::new();
        let media = dir("/media");
        media.set_object_id(Some(ObjectId(42)));
        registry.add(media).unwrap();
        registry.add(dir("/music")).unwrap();

        let found = registry.get_by_object_id(ObjectId(42)).unwrap();
        assert_eq!(found.location(), Some(Path::new("/media")));
        assert!(registry.get_by_object_id(ObjectId(43)).is_none());

        registry.remove_by_object_id(ObjectId(42)).unwrap();
        assert!(registry.get_by_location(Path::new("/media")).is_none());
    }

    #[test]
    fn subtree_removal_matches_location_prefixes() {
        let registry = AutoscanRegistry::new();
        registry.add(dir("/a")).unwrap();
        registry.add(dir("/a/b")).unwrap();
        registry.add(dir("/ab")).unwrap();
        registry.add(dir("/b/a")).unwrap();

        let removed = registry.remove_subtree(Path::new("/a"), false);

        let removed_locations: Vec<PathBuf> = removed
            .snapshot()
            .iter()
            .filter_map(|dir| dir.location().map(Path::to_path_buf))
            .collect();
        assert_eq!(
            removed_locations,
            vec![
                PathBuf::from("/a"),
                PathBuf::from("/a/b"),
                PathBuf::from("/ab")
            ]
        );
        assert!(registry.get_by_location(Path::new("/ab")).is_none());
        assert!(registry.get_by_location(Path::new("/b/a")).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn subtree_copies_are_independent() {
        let registry = AutoscanRegistry::new();
        let original = dir("/a/b");
        registry.add(Arc::clone(&original)).unwrap();

        let removed = registry.remove_subtree(Path::new("/a"), false);
        let copy = removed.get(ScanId(0)).unwrap();
        copy.set_object_id(Some(ObjectId(99)));

        assert!(!Arc::ptr_eq(&copy, &original));
        assert_eq!(original.object_id(), None);
    }

    #[test]
    fn subtree_removal_can_include_persistent_entries() {
        let registry = AutoscanRegistry::new();
        registry.add(persistent("/a")).unwrap();
        registry.add(dir("/a/x")).unwrap();

        let removed = registry.remove_subtree(Path::new("/a"), true);
        assert_eq!(removed.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn add_all_is_not_transactional() {
        let target = AutoscanRegistry::new();
        target.add(dir("/b")).unwrap();

        let source = AutoscanRegistry::new();
        source.add(dir("/a")).unwrap();
        source.add(dir("/b")).unwrap();
        source.add(dir("/c")).unwrap();

        let err = target.add_all(&source).unwrap_err();
        assert!(matches!(err, IndexError::DuplicateWatch(path) if path == Path::new("/b")));
        assert!(target.get_by_location(Path::new("/a")).is_some());
        assert!(target.get_by_location(Path::new("/c")).is_none());
    }

    #[test]
    fn unlocated_directory_is_rejected() {
        let registry = AutoscanRegistry::new();
        let unlocated = AutoscanDirectory::unlocated(AutoscanSettings::default()).shared();
        assert!(matches!(
            registry.add(unlocated),
            Err(IndexError::InvalidOperation(_))
        ));
    }
}
