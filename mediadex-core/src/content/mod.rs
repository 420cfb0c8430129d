//! The content manager and its collaborators.
//!
//! [`ContentManager`] is the entry point for administrative requests. It
//! reaches storage through a [`CachedStorage`] and the disk through a
//! [`FileSystem`]; both are traits so tests can run entirely in memory.

pub mod cached;
pub mod fs;
pub mod manager;
pub mod storage;
mod tasks;

pub use cached::CachedStorage;
pub use fs::{FileSystem, FsMetadata, InMemoryFs, ReadDirStream, RealFs};
pub use manager::{Accounting, AddFileOptions, ContentManager, ContentServices};
pub use storage::{ContentStorage, InMemoryStorage, NewObject, StoredObject};
