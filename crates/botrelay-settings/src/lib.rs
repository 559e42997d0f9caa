//! # botrelay-settings
//!
//! Configuration management with layered sources for the relay.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: `~/.botrelay/settings.json` or an explicit path (deep-merged over defaults)
//! 3. **Environment variables**: `BOTRELAY_*` overrides (highest priority)
//!
//! Settings are passed explicitly to the components that need them; there
//! is no process-wide singleton.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;
