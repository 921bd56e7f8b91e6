//! Error types for opsrelay

mod error;

pub use error::{RelayError, Result};
