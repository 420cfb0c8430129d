//! Watched directories and the timer plumbing that drives timed rescans.

pub mod directory;
pub mod registry;
pub mod timer;

pub use directory::{
    AutoscanDirectory, AutoscanRecord, AutoscanSettings, ScanLevel, ScanMode, SharedDirectory,
};
pub use registry::AutoscanRegistry;
pub use timer::{IntervalTimer, Timer, TimerParameter, TimerSubscriber};
