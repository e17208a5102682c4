//! # chorus-core
//!
//! Core types and error handling shared across the Chorus playback stack.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
