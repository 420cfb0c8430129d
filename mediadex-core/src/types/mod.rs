pub mod ids;

pub use ids::{ObjectId, ScanId, TaskId};
