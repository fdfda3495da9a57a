//! Upload runtime
//!
//! The executor that runs part uploads and the wait group writers use to
//! drain them.

pub mod executor;
pub mod wait_group;

pub use executor::{ExecutorConfig, UploadExecutor};
pub use wait_group::WaitGroup;
