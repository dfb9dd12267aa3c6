//! Domain model and collaborator contracts for the cadence sync engine.

pub mod api;
pub mod cache;
pub mod clock;
pub mod entity;
pub mod errors;
pub mod grouping;
pub mod sync;

pub use errors::{Error, NetworkError, Result};
