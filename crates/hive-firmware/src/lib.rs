//! ESP32 firmware-specific modules for the hive sensing node
//!
//! This crate contains the hardware-specific code that cannot compile on
//! desktop targets: peripheral bring-up for the TTGO LoRa32 board, the
//! RFM95 LoRa transceiver driver and RTC deep sleep. Everything else lives
//! in `hive_core`.

#![no_std]

extern crate alloc;

pub mod app_state;
pub mod power;
pub mod rf95;
