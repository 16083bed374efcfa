//! Configuration Module
//!
//! Handles configuration loading, validation, and endpoint resolution.

pub mod manager;
pub mod types;

pub use manager::ConfigManager;
pub use types::*;
