//! HTTP implementation of the collection API used by the cadence sync engine.

mod client;
mod error;

pub use client::SyncApiClient;
pub use error::{Result, SyncClientError};
