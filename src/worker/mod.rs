//! Background execution of conversions.
//!
//! - `job`: the workload handed to the executor and the runner trait it calls
//! - `executor`: bounded FIFO pool that drives each task through its lifecycle

pub mod executor;
pub mod job;

pub use executor::BackgroundExecutor;
pub use job::{Workload, WorkloadRunner};
