pub mod loader;
pub mod sources;

pub use loader::{ConfigLoad, ConfigLoader};
