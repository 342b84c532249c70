//! # storesync-settings
//!
//! Layered configuration for the sync server.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`SyncSettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over the defaults
//! 3. **Environment variables**: `STORESYNC_*` overrides (highest priority)
//!
//! The result is validated before it is handed to the server.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{LivenessSettings, LoggingSettings, ServerSettings, SyncSettings};
