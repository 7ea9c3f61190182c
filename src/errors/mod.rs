//! # Error Handling
//!
//! Process-level errors (configuration loading, registry construction).

mod types;

pub use types::{LatchkeyError, Result};

/// Short alias used at the crate root
pub type Error = LatchkeyError;
