use alloc::vec::Vec;
use log::{info, warn};
use thiserror_no_std::Error;

use super::{LogStore, WriteMode};
use crate::config::{ConfigError, SettingsStore};

/// Postcard blob of the runtime settings, next to the log segments.
pub const SETTINGS_FILE: &str = "SETTINGS.BIN";

/// Load the stored settings, falling back to defaults when the card has none
/// or the blob does not decode.
pub fn load_settings<S: LogStore>(store: &mut S) -> SettingsStore {
    let mut blob = Vec::new();
    match store.read_file(SETTINGS_FILE, &mut |chunk| blob.extend_from_slice(chunk)) {
        Ok(true) => match SettingsStore::from_bytes(&blob) {
            Ok(settings) => {
                info!("Loaded settings from {}", SETTINGS_FILE);
                settings
            }
            Err(e) => {
                warn!("{} unreadable ({}), using defaults", SETTINGS_FILE, e);
                SettingsStore::default()
            }
        },
        Ok(false) => SettingsStore::default(),
        Err(e) => {
            warn!("Could not read {}: {:?}", SETTINGS_FILE, e);
            SettingsStore::default()
        }
    }
}

#[derive(Error, Debug)]
pub enum SaveError<E: core::fmt::Debug> {
    #[error("settings could not be encoded: {0}")]
    Encoding(ConfigError),
    #[error("storage operation failed: {0:?}")]
    Storage(E),
}

/// Replace the stored settings with the current ones.
pub fn save_settings<S: LogStore>(
    store: &mut S,
    settings: &SettingsStore,
) -> Result<(), SaveError<S::Error>> {
    let blob = settings.to_bytes().map_err(SaveError::Encoding)?;
    store
        .write_file(SETTINGS_FILE, WriteMode::Truncate, &blob)
        .map_err(SaveError::Storage)
}
