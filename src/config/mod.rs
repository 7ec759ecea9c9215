//! Configuration loading and management.
//!
//! Split into logical submodules:
//! - [`types`]: Config struct definitions and TOML loading
//! - [`defaults`]: default values for every tunable

mod defaults;
mod types;

pub use types::{
    CampaignConfig, Config, ConfigError, DatabaseConfig, GatewayConfig, VerificationConfig,
};
