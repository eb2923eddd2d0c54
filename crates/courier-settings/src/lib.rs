//! # courier-settings
//!
//! Node configuration, loaded in three layers (lowest priority first):
//! 1. **Compiled defaults**: [`CourierSettings::default()`]
//! 2. **Settings file**: `~/.courier/settings.json`, deep-merged over defaults
//! 3. **Environment**: `COURIER_*` variables
//!
//! The loaded value is handed to `main` and passed down explicitly; there is
//! no global instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, resolve_store_path, settings_path};
pub use types::*;
