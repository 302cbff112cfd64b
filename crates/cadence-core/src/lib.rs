//! `cadence-core` — configuration and shared error type for the Cadence scheduler.

pub mod config;
pub mod error;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
