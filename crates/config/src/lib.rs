//! Configuration module for maxqueue
//!
//! Handles the service configuration (TOML file plus environment variable
//! overrides) and the persisted user settings record.

pub mod config;
pub mod settings;

pub use config::*;
pub use settings::{Settings, SettingsPatch, SettingsStore, StorageError};
