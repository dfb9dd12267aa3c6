//! Sync domain models, retry policy and scheduler constants.

mod retry_policy;
mod sync_model;
mod sync_scheduler;

pub use retry_policy::*;
pub use sync_model::*;
pub use sync_scheduler::*;
