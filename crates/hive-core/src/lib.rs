//! Hardware-independent core library for the hive sensing node
//!
//! This crate contains all platform-agnostic logic of the node: the typed
//! event bus, the oversampling sensor aggregator, the rotating SD card log
//! with its sequence-counter recovery, the point-to-point radio relay
//! protocol and the wake/sleep controller that duty-cycles the hardware.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32) and desktop hosts (for the simulator and tests).

#![no_std]
#![allow(async_fn_in_trait)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod app_state;
pub mod config;
pub mod events;
pub mod input;
pub mod power;
pub mod radio;
pub mod sensors;
pub mod storage;
