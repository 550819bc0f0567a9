//! Conversion task lifecycle.
//!
//! - `model`: `TaskRecord` and the status state machine
//!   (Pending → Processing → Completed/Failed)
//! - `manager`: creation, transitions, and reads through the task store
//! - `sweeper`: recurring deletion of records past the retention window

pub mod manager;
pub mod model;
pub mod sweeper;

pub use manager::TaskManager;
pub use model::{TaskId, TaskRecord, TaskStatus};
pub use sweeper::{RetentionSweeper, SweeperHandle};
