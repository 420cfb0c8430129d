//! Background task pipeline.
//!
//! Work is expressed as [`Task`] implementations and pushed onto a
//! [`TaskScheduler`], which runs them one at a time on a dedicated worker.
//! Cancellation is cooperative: invalidating a task flips a flag that queued
//! tasks are skipped on, and that running tasks observe through
//! [`TaskContext::checkpoint`].

pub mod processor;
pub mod task;

pub use processor::TaskScheduler;
pub use task::{
    Task, TaskContext, TaskInfo, TaskKind, TaskOptions, TaskOwner, TaskPriority,
};
