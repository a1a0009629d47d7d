//! # Agentcell Core
//!
//! Shared foundation for the Agentcell workspace: the error taxonomy every
//! crate speaks, and TOML configuration loading.

pub mod config;
pub mod error;

pub use config::CellConfig;
pub use error::{Error, Result};
