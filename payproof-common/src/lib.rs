//! # Payproof Common Library
//!
//! Shared code for the payment proof services:
//! - Error type and result alias
//! - Configuration loading (TOML + environment) and root folder resolution
//! - Verdict event bus for downstream consumers

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
