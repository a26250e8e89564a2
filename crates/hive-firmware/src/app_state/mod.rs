//! Firmware-specific application state extensions
//!
//! Re-exports the hardware-independent app state from `hive_core` and
//! adds the ESP32 peripheral initialization.

mod hardware;

pub use hardware::*;

// Re-export all shared app state types from hive-core
pub use hive_core::app_state::*;
