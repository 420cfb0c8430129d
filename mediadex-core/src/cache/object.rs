use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::types::ids::ObjectId;

/// Cached summary of a stored content object.
///
/// A freshly reserved entry only knows its id; whoever reserved it fills in
/// the rest. The location is owned by the cache index and can only be changed
/// through [`super::StorageCache::set_location`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheObject {
    pub id: ObjectId,
    pub parent_id: Option<ObjectId>,
    location: Option<PathBuf>,
    pub is_container: bool,
    /// `None` while the child count has not been loaded.
    pub num_children: Option<u32>,
    pub modified: Option<DateTime<Utc>>,
}

pub type CacheEntry = Arc<Mutex<CacheObject>>;

impl CacheObject {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            parent_id: None,
            location: None,
            is_container: false,
            num_children: None,
            modified: None,
        }
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    pub(super) fn set_location(&mut self, location: Option<PathBuf>) {
        self.location = location;
    }

    pub fn knows_num_children(&self) -> bool {
        self.num_children.is_some()
    }
}
