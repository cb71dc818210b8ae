//! Shared types for the worldspace server: identifiers, transforms, bounding
//! volumes, and the task scheduling seam used for client-facing work.

pub mod bounds;
pub mod task;
pub mod types;

pub use bounds::Bounds;
pub use task::{InlineScheduler, QueuedScheduler, Task, TaskError, TaskScheduler};
pub use types::{CellDescription, CellId, Identity, Transform};
