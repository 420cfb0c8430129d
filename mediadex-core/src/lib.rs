//! # Mediadex Core
//!
//! Content indexing engine of the Mediadex media server: it decides which
//! files need to be (re)imported, queues that work and keeps a cache of what
//! the storage engine already knows.
//!
//! ## Architecture
//!
//! - [`lifecycle`]: ordered shutdown and reactivation of long-lived services
//! - [`scheduler`]: two-lane task queue drained by a single worker
//! - [`autoscan`]: watched directories, their registry and the rescan timer
//! - [`cache`]: bounded object cache indexed by id and location
//! - [`content`]: the content manager tying the pieces together
//! - [`config`]: indexer settings
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mediadex_core::{
//!     config::IndexerConfig,
//!     content::{ContentManager, InMemoryStorage, RealFs},
//!     lifecycle::ProcessContext,
//! };
//!
//! async fn run() -> mediadex_core::Result<()> {
//!     let ctx = ProcessContext::new();
//!     let manager = ContentManager::launch(
//!         &ctx,
//!         &IndexerConfig::default(),
//!         Arc::new(InMemoryStorage::new()),
//!         Arc::new(RealFs::new()),
//!     )
//!     .await?;
//!
//!     manager.add_file("/srv/media", Default::default())?;
//!     manager.scheduler().wait_for_idle().await;
//!     ctx.shutdown_all(true).await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod autoscan;
pub mod cache;
pub mod config;
pub mod content;
pub mod error;
pub mod lifecycle;
pub mod scheduler;
pub mod types;

pub use error::{IndexError, Result};
pub use types::ids::{ObjectId, ScanId, TaskId};
